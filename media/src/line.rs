//! Per-call audio line state shared between threads.
//!
//! A voice call touches its line from two threads: the dispatch thread
//! transcodes inbound payloads, the audio input thread transcodes the
//! microphone. Flags and level estimates are atomics so neither side needs
//! a lock to read them; the recorder sits behind its own mutex because both
//! directions write into it.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

use crate::codec::smoothed_level;
use crate::recorder::{Recorder, RecorderError};

/// Shared audio state of one call.
#[derive(Debug, Default)]
pub struct LineState {
    // ---
    muted: AtomicBool,

    /// `f64` bit patterns; each is written by exactly one thread.
    level_in: AtomicU64,
    level_out: AtomicU64,

    pub(crate) recorder: Mutex<Option<Recorder>>,
}

impl LineState {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Smoothed level of the remote party, 0.0..=1.0.
    pub fn level_in(&self) -> f64 {
        f64::from_bits(self.level_in.load(Ordering::Relaxed))
    }

    /// Smoothed level of the local party, 0.0..=1.0.
    pub fn level_out(&self) -> f64 {
        f64::from_bits(self.level_out.load(Ordering::Relaxed))
    }

    pub(crate) fn update_level_in(&self, peak: i32, samples: usize) {
        let next = smoothed_level(self.level_in(), peak, samples);
        self.level_in.store(next.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn update_level_out(&self, peak: i32, samples: usize) {
        let next = smoothed_level(self.level_out(), peak, samples);
        self.level_out.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_some()
    }

    /// Opens (or appends to) a recording at `path`.
    ///
    /// A recording already in progress is closed first.
    pub fn start_recording(&self, path: impl AsRef<Path>) -> Result<(), RecorderError> {
        // ---
        let recorder = Recorder::open(path)?;
        let previous = self.recorder.lock().replace(recorder);

        if let Some(previous) = previous {
            debug!("Replacing active recording {}", previous.path().display());
            previous.close()?;
        }

        Ok(())
    }

    /// Stops recording, flushing everything still buffered.
    ///
    /// Returns the total number of stereo frames the recording received, or
    /// `None` if nothing was being recorded.
    pub fn stop_recording(&self) -> Result<Option<u64>, RecorderError> {
        // ---
        let recorder = self.recorder.lock().take();

        match recorder {
            Some(recorder) => {
                let path = recorder.path().to_path_buf();
                let frames = recorder.close()?;
                info!("Recording {} closed ({} frames)", path.display(), frames);
                Ok(Some(frames))
            }
            None => Ok(None),
        }
    }

    /// Flushes the recorder; returns the number of frames written.
    pub fn flush_recording(&self, force: bool) -> Result<usize, RecorderError> {
        // ---
        match self.recorder.lock().as_mut() {
            Some(recorder) => recorder.flush(force),
            None => Ok(0),
        }
    }
}
