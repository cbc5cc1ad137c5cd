//! Host capability set and deferred delivery of host callbacks.

use std::sync::Arc;
use tracing::warn;

use crate::connection::CallInfo;
use crate::error::CapiError;
use crate::transfer::FaxHandle;

/// Everything the engine needs from its host application.
///
/// Audio methods may be called from the dispatch thread and from the audio
/// input thread of each voice call. Event callbacks are always invoked with
/// no engine lock held, so they may call back into the [`Session`].
///
/// [`Session`]: crate::Session
pub trait Handlers: Send + Sync + 'static {
    // ---
    /// Opaque audio device handle.
    type Audio: Send + Sync + 'static;

    /// Opens the audio device for a voice call; `None` if unavailable.
    fn audio_open(&self) -> Option<Self::Audio>;

    /// Reads microphone data (16-bit LE PCM, 8 kHz mono) into `buf`.
    ///
    /// Returns the number of bytes read; 0 when nothing is available yet.
    fn audio_input(&self, audio: &Self::Audio, buf: &mut [u8]) -> usize;

    /// Plays 16-bit LE PCM; returns the number of bytes written.
    fn audio_output(&self, audio: &Self::Audio, buf: &[u8]) -> usize;

    /// Closes the device; `false` if closing failed.
    fn audio_close(&self, audio: &Self::Audio) -> bool;

    /// Bearer leg is up and audio is flowing.
    fn connected(&self, call: &CallInfo);

    /// Call is gone; the id is no longer valid afterwards.
    fn disconnected(&self, call: &CallInfo);

    /// Inbound call is alerting.
    fn ring(&self, call: &CallInfo);

    /// DTMF digit received.
    fn code(&self, call: &CallInfo, code: char);

    /// Asynchronous failure, optionally tied to a call.
    fn status(&self, call: Option<&CallInfo>, error: &CapiError);
}

/// Host call collected while the connection table is locked.
pub(crate) enum Deferred<A> {
    Connected(CallInfo),
    Disconnected(CallInfo),
    Ring(CallInfo),
    Code(CallInfo, char),
    Status(Option<CallInfo>, CapiError),
    Playback(Arc<A>, Vec<u8>),
    FaxActive(FaxHandle, CallInfo),
    FaxPayload(FaxHandle, CallInfo, Vec<u8>),
    FaxCleanup(FaxHandle, CallInfo),
}

/// Ordered list of deferred host calls.
pub(crate) struct Outbox<A> {
    items: Vec<Deferred<A>>,
}

impl<A> Default for Outbox<A> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<A> Outbox<A> {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Deferred<A>) {
        self.items.push(item);
    }

    pub fn status(&mut self, call: Option<CallInfo>, error: CapiError) {
        self.items.push(Deferred::Status(call, error));
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs every collected call in order. Must be called without the
    /// connection table locked.
    pub fn deliver<H: Handlers<Audio = A>>(self, handlers: &H) {
        // ---
        for item in self.items {
            match item {
                Deferred::Connected(call) => handlers.connected(&call),
                Deferred::Disconnected(call) => handlers.disconnected(&call),
                Deferred::Ring(call) => handlers.ring(&call),
                Deferred::Code(call, code) => handlers.code(&call, code),
                Deferred::Status(call, error) => {
                    warn!(
                        "Call {}: {}",
                        call.as_ref()
                            .map_or_else(|| "-".to_string(), |c| c.id.to_string()),
                        error
                    );
                    handlers.status(call.as_ref(), &error);
                }
                Deferred::Playback(audio, pcm) => {
                    let written = handlers.audio_output(&audio, &pcm);
                    if written < pcm.len() {
                        tracing::trace!("Audio output short write: {}/{}", written, pcm.len());
                    }
                }
                Deferred::FaxActive(fax, call) => fax.lock().on_active(&call),
                Deferred::FaxPayload(fax, call, data) => fax.lock().on_payload(&call, &data),
                Deferred::FaxCleanup(fax, call) => fax.lock().on_cleanup(&call),
            }
        }
    }
}
