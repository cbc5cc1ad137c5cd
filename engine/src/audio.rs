//! Audio input thread of a voice call.
//!
//! Pulls microphone PCM from the host, transcodes it to the wire format
//! and sends it on the call's bearer leg. The inbound direction needs no
//! thread: payload indications are transcoded on the dispatch thread.
//!
//! Start and stop are coordinated through a three-value flag:
//! `STOPPED -> STARTED` by the starter, `STARTED -> STOPPING` by whoever
//! stops the call, `STOPPING -> STOPPED` by the thread on its way out.

use capi_phone_common::MetricsContext;
use media::LineState;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::controller::{Controller, Request};
use crate::error::CapiError;
use crate::handlers::Handlers;
use crate::link::Link;

const STOPPED: u8 = 0;
const STARTED: u8 = 1;
const STOPPING: u8 = 2;

/// Bytes of PCM read per iteration (10 ms at 8 kHz).
const INPUT_CHUNK: usize = 160;

/// Back-off when the host has no input ready.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// What the input thread needs from its call.
pub(crate) struct InputContext<C, H: Handlers> {
    // ---
    pub link: Arc<Link<C>>,
    pub handlers: Arc<H>,
    pub audio: Arc<H::Audio>,
    pub line: Arc<LineState>,

    /// Bearer leg to send on; 0 while there is none (e.g. on hold).
    pub ncci: Arc<AtomicU32>,

    pub metrics: MetricsContext,
    pub flush_interval: Duration,
}

/// Handle of the input thread of one call.
pub(crate) struct AudioInput {
    // ---
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Default for AudioInput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInput {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            state: Arc::new(AtomicU8::new(STOPPED)),
            handle: None,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STARTED
    }

    /// Starts the thread unless it is already running.
    ///
    /// Returns `Ok(false)` if nothing was started.
    pub fn start<C: Controller, H: Handlers>(
        &mut self,
        ctx: InputContext<C, H>,
    ) -> Result<bool, CapiError> {
        // ---
        if self
            .state
            .compare_exchange(STOPPED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        // A previous thread already reported STOPPED; reap it
        if let Some(previous) = self.handle.take() {
            let _ = previous.join();
        }

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("phone-input".into())
            .spawn(move || input_loop(ctx, state));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.state.store(STOPPED, Ordering::Release);
                Err(CapiError::Thread("phone-input", e))
            }
        }
    }

    /// Asks the thread to stop and waits up to `timeout` for it.
    ///
    /// Returns `false` if the thread did not acknowledge in time; it is
    /// then left to exit on its own.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        // ---
        let _ = self.state.compare_exchange(
            STARTED,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let deadline = Instant::now() + timeout;
        while self.state.load(Ordering::Acquire) != STOPPED {
            if Instant::now() >= deadline {
                warn!("Audio input thread did not stop within {:?}", timeout);
                self.handle = None;
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Audio input thread panicked");
            }
        }
        true
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        // ---
        let _ = self.state.compare_exchange(
            STARTED,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

fn input_loop<C: Controller, H: Handlers>(ctx: InputContext<C, H>, state: Arc<AtomicU8>) {
    // ---
    debug!("Audio input thread started");

    let mut buffer = [0u8; INPUT_CHUNK];
    let mut last_flush = Instant::now();

    while state.load(Ordering::Acquire) == STARTED {
        let len = ctx
            .handlers
            .audio_input(&ctx.audio, &mut buffer)
            .min(INPUT_CHUNK);

        if len == 0 {
            thread::sleep(IDLE_SLEEP);
        } else {
            let wire = media::to_wire(&ctx.line, &buffer[..len]);
            let ncci = ctx.ncci.load(Ordering::Acquire);

            if ncci != 0 && !wire.data.is_empty() {
                let request = Request::Data {
                    ncci,
                    data: wire.data,
                    handle: ctx.link.next_number(),
                };
                if let Err(e) = ctx.link.request(request) {
                    trace!("Dropping outbound audio: {}", e);
                }
            }
        }

        if last_flush.elapsed() >= ctx.flush_interval {
            last_flush = Instant::now();
            match ctx.line.flush_recording(false) {
                Ok(frames) => ctx.metrics.recorder_frames_flushed_total.inc_by(frames as u64),
                Err(e) => warn!("Recorder flush failed: {}", e),
            }
        }
    }

    state.store(STOPPED, Ordering::Release);
    debug!("Audio input thread stopped");
}
