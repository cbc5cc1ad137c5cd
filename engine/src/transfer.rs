//! Kind-specific media handling of a connection.
//!
//! A connection carries no media until the host dials or picks up with a
//! [`Service`]. Voice media is handled here (codec, audio device, input
//! thread); fax payloads are handed to a host-supplied [`FaxTransfer`].

use media::LineState;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::{AudioInput, InputContext};
use crate::connection::{CallInfo, Kind};
use crate::controller::Controller;
use crate::error::CapiError;
use crate::handlers::{Deferred, Handlers, Outbox};
use crate::params::{CIP_FAX_G3, CIP_VOICE};
use crate::session::Shared;

/// Host-side fax engine fed with the raw bearer payload of a fax call.
pub trait FaxTransfer: Send + 'static {
    // ---
    /// Bearer leg is up.
    fn on_active(&mut self, _call: &CallInfo) {}

    /// Payload received (wire format, bit-reversed A-law).
    fn on_payload(&mut self, call: &CallInfo, data: &[u8]);

    /// Call is torn down; release private state.
    fn on_cleanup(&mut self, _call: &CallInfo) {}
}

/// Service requested by the host for a call.
pub enum Service {
    Voice,
    Fax(Box<dyn FaxTransfer>),
}

impl Service {
    // ---
    pub fn kind(&self) -> Kind {
        match self {
            Service::Voice => Kind::Voice,
            Service::Fax(_) => Kind::Fax,
        }
    }

    /// CIP value used when dialing.
    pub fn cip(&self) -> u16 {
        match self {
            Service::Voice => CIP_VOICE,
            Service::Fax(_) => CIP_FAX_G3,
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Voice => f.write_str("Voice"),
            Service::Fax(_) => f.write_str("Fax"),
        }
    }
}

pub(crate) type FaxHandle = Arc<Mutex<Box<dyn FaxTransfer>>>;

/// Voice state of a connection.
pub(crate) struct Voice<A> {
    // ---
    pub line: Arc<LineState>,
    pub audio: Option<Arc<A>>,
    pub ncci: Arc<AtomicU32>,
    pub input: AudioInput,
}

/// Media of a connection.
pub(crate) enum Media<A> {
    None,
    Voice(Voice<A>),
    Fax(FaxHandle),
}

impl<A> Media<A> {
    // ---
    pub fn from_service(service: Service) -> Self {
        // ---
        match service {
            Service::Voice => Media::Voice(Voice {
                line: Arc::new(LineState::new()),
                audio: None,
                ncci: Arc::new(AtomicU32::new(0)),
                input: AudioInput::new(),
            }),
            Service::Fax(fax) => Media::Fax(Arc::new(Mutex::new(fax))),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Media::None => Kind::None,
            Media::Voice(_) => Kind::Voice,
            Media::Fax(_) => Kind::Fax,
        }
    }

    /// Voice requests the bearer leg as soon as in-band progress is
    /// signalled; fax waits for the call to be answered.
    pub fn early_b3(&self) -> bool {
        matches!(self, Media::Voice(_))
    }

    pub fn line(&self) -> Option<&Arc<LineState>> {
        match self {
            Media::Voice(voice) => Some(&voice.line),
            _ => None,
        }
    }

    /// Bearer leg is gone; the input thread keeps running but stops sending.
    pub fn suspend(&self) {
        if let Media::Voice(voice) = self {
            voice.ncci.store(0, Ordering::Release);
        }
    }
}

impl<A: Send + Sync + 'static> Media<A> {
    // ---
    /// Opens the audio device of a voice call (once).
    pub fn open_audio<H: Handlers<Audio = A>>(&mut self, handlers: &H) -> Result<(), CapiError> {
        // ---
        let Media::Voice(voice) = self else {
            return Ok(());
        };
        if voice.audio.is_some() {
            return Ok(());
        }

        match handlers.audio_open() {
            Some(audio) => {
                debug!("Audio device opened");
                voice.audio = Some(Arc::new(audio));
                Ok(())
            }
            None => Err(CapiError::AudioOpenFailed),
        }
    }

    /// Bearer leg is up: voice starts its input thread, fax is notified.
    pub fn on_active<C: Controller, H: Handlers<Audio = A>>(
        &mut self,
        shared: &Shared<C, H>,
        call: &CallInfo,
        out: &mut Outbox<A>,
    ) -> Result<(), CapiError> {
        // ---
        match self {
            Media::None => Ok(()),
            Media::Voice(voice) => {
                voice.ncci.store(call.ncci, Ordering::Release);

                let Some(audio) = voice.audio.clone() else {
                    warn!("Call {} has no audio device, not starting input", call.id);
                    return Ok(());
                };

                let ctx = InputContext {
                    link: Arc::clone(&shared.link),
                    handlers: Arc::clone(&shared.handlers),
                    audio,
                    line: Arc::clone(&voice.line),
                    ncci: Arc::clone(&voice.ncci),
                    metrics: shared.metrics.clone(),
                    flush_interval: shared.config.record_flush_interval(),
                };

                if voice.input.start(ctx)? {
                    debug!("Call {}: audio input started", call.id);
                }
                Ok(())
            }
            Media::Fax(fax) => {
                out.push(Deferred::FaxActive(Arc::clone(fax), call.clone()));
                Ok(())
            }
        }
    }

    /// Payload received on the bearer leg. `call` is only evaluated for
    /// fax, keeping the voice path free of snapshots.
    pub fn on_payload(
        &self,
        call: impl FnOnce() -> CallInfo,
        data: Vec<u8>,
        out: &mut Outbox<A>,
    ) {
        // ---
        match self {
            Media::None => {}
            Media::Voice(voice) => {
                let pcm = media::to_linear(&voice.line, &data);
                if let Some(audio) = &voice.audio {
                    out.push(Deferred::Playback(Arc::clone(audio), pcm.data));
                }
            }
            Media::Fax(fax) => {
                out.push(Deferred::FaxPayload(Arc::clone(fax), call(), data));
            }
        }
    }

    /// Connection is torn down: stop input, close audio and recording.
    ///
    /// Returns the number of recorder frames flushed on the way out.
    pub fn on_cleanup<H: Handlers<Audio = A>>(
        &mut self,
        handlers: &H,
        stop_timeout: Duration,
        call: &CallInfo,
        out: &mut Outbox<A>,
    ) -> usize {
        // ---
        match self {
            Media::None => 0,
            Media::Voice(voice) => {
                voice.ncci.store(0, Ordering::Release);
                voice.input.stop(stop_timeout);

                if let Some(audio) = voice.audio.take() {
                    if !handlers.audio_close(&audio) {
                        warn!("Call {}: closing audio device failed", call.id);
                    }
                }

                let flushed = voice.line.flush_recording(true).unwrap_or_else(|e| {
                    warn!("Call {}: final recorder flush failed: {}", call.id, e);
                    0
                });
                if let Err(e) = voice.line.stop_recording() {
                    warn!("Call {}: closing recording failed: {}", call.id, e);
                }
                flushed
            }
            Media::Fax(fax) => {
                out.push(Deferred::FaxCleanup(Arc::clone(fax), call.clone()));
                0
            }
        }
    }
}
