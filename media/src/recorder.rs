//! Dual-channel call recorder.
//!
//! The local (microphone) and remote (B-channel) legs are produced by
//! different threads with independent timing. Each leg is written into its
//! own ring buffer at the position implied by wall-clock time since the
//! recording started, so the legs line up even when one of them stalls.
//! Flushing interleaves both rings into a stereo WAV file.
//!
//! # Design
//!
//! - **Fixed capacity**: rings never grow; a late leg loses data instead of
//!   stalling the audio path.
//! - **Jitter tolerance**: a write landing within [`RECORDING_JITTER`]
//!   samples of the previous end is treated as contiguous.
//! - **Hold-back**: a regular flush leaves the newest eighth of the ring
//!   in place so the lagging leg can still fill it in.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::SAMPLE_RATE;

/// Ring capacity per leg, in samples (about 4 s at 8 kHz).
pub const RECORDING_BUFSIZE: usize = 32768;

/// Allowed skew, in samples, between expected and actual write position.
pub const RECORDING_JITTER: i64 = 200;

const BUFSIZE: i64 = RECORDING_BUFSIZE as i64;
const HOLD_BACK: i64 = BUFSIZE / 8;
const MAX_SPAN: i64 = BUFSIZE * 7 / 8;

/// Recording leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Near end (what we send).
    Local,

    /// Far end (what we receive).
    Remote,
}

/// What happened to a buffer handed to [`RingRecorder::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in full starting at `start`.
    Written { start: i64 },

    /// The first `dropped` samples overlapped data already written and were
    /// discarded; the rest was stored.
    Clipped { dropped: usize },

    /// The whole buffer lay behind the write cursor (or was empty).
    Discarded,
}

/// Errors from the recording sink. Never fatal to the call itself.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("recording sink {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error(
        "existing recording {path} has an incompatible format \
         ({channels} channels, {sample_rate} Hz, {bits} bits)"
    )]
    IncompatibleFormat {
        path: PathBuf,
        channels: u16,
        sample_rate: u32,
        bits: u16,
    },
}

#[derive(Clone)]
struct RecordChannel {
    position: i64,
    buffer: Vec<i16>,
}

impl RecordChannel {
    fn new() -> Self {
        Self {
            position: 0,
            buffer: vec![0; RECORDING_BUFSIZE],
        }
    }
}

/// The two ring buffers plus the flush cursor, without any sink.
#[derive(Clone)]
pub struct RingRecorder {
    // ---
    local: RecordChannel,
    remote: RecordChannel,

    /// Position up to which samples have been flushed.
    last_write: i64,
}

impl Default for RingRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl RingRecorder {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            local: RecordChannel::new(),
            remote: RecordChannel::new(),
            last_write: 0,
        }
    }

    /// Write cursor of a leg, in samples since the recording started.
    pub fn position(&self, channel: Channel) -> i64 {
        self.channel(channel).position
    }

    /// Flush cursor, in samples since the recording started.
    pub fn last_write(&self) -> i64 {
        self.last_write
    }

    fn channel(&self, channel: Channel) -> &RecordChannel {
        match channel {
            Channel::Local => &self.local,
            Channel::Remote => &self.remote,
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut RecordChannel {
        match channel {
            Channel::Local => &mut self.local,
            Channel::Remote => &mut self.remote,
        }
    }

    /// Stores `samples` so that the last one lands at `end_pos - 1`.
    ///
    /// `end_pos` is the wall-clock derived sample position at the time of
    /// the write. The leg's cursor never moves backwards.
    pub fn write(&mut self, end_pos: i64, samples: &[i16], channel: Channel) -> WriteOutcome {
        // ---
        if samples.is_empty() {
            warn!("Ignoring empty recorder write");
            return WriteOutcome::Discarded;
        }

        // Only the newest ring's worth of a huge buffer can be kept anyway
        let mut buf = &samples[samples.len().saturating_sub(RECORDING_BUFSIZE)..];
        let size = buf.len() as i64;

        let chan = self.channel_mut(channel);
        let position = chan.position;

        let mut start = end_pos - size;
        let mut end = end_pos;

        if (start - position).abs() <= RECORDING_JITTER {
            start = position;
            end = position + size;
        }

        let mut dropped = 0usize;
        if start < position {
            let delta = position - start;
            if delta >= size {
                return WriteOutcome::Discarded;
            }
            dropped = delta as usize;
            buf = &buf[dropped..];
            start = position;
        }

        let offset = start.rem_euclid(BUFSIZE) as usize;
        let first = buf.len().min(RECORDING_BUFSIZE - offset);
        chan.buffer[offset..offset + first].copy_from_slice(&buf[..first]);
        chan.buffer[..buf.len() - first].copy_from_slice(&buf[first..]);

        chan.position = end;

        if dropped > 0 {
            WriteOutcome::Clipped { dropped }
        } else {
            WriteOutcome::Written { start }
        }
    }

    /// Moves flushable samples into `out` as interleaved (local, remote)
    /// frames and returns the number of frames appended.
    ///
    /// Unless `force` is set, the newest eighth of the ring is held back and
    /// nothing is emitted until at least an eighth is ready.
    pub fn drain(&mut self, force: bool, out: &mut Vec<i16>) -> usize {
        // ---
        let mut max_position = self.local.position.max(self.remote.position);
        let mut start = self.last_write;

        if start + MAX_SPAN < max_position {
            debug!(
                "Recorder overrun, skipping {} samples",
                max_position - MAX_SPAN - start
            );
            start = max_position - MAX_SPAN;
        }

        if !force {
            max_position -= HOLD_BACK;
        }

        let size = max_position - start;
        if max_position <= 0 || size <= 0 || (!force && size < HOLD_BACK) {
            return 0;
        }

        out.reserve(size as usize * 2);
        let mut src = start.rem_euclid(BUFSIZE) as usize;

        for _ in 0..size {
            out.push(std::mem::take(&mut self.local.buffer[src]));
            out.push(std::mem::take(&mut self.remote.buffer[src]));
            src = (src + 1) % RECORDING_BUFSIZE;
        }

        self.last_write = max_position;
        size as usize
    }
}

/// Ring recorder bound to a stereo 8 kHz WAV file.
pub struct Recorder {
    // ---
    ring: RingRecorder,
    sink: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
    started: Instant,
    frames_written: u64,
    scratch: Vec<i16>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .field("frames_written", &self.frames_written)
            .field("open", &self.sink.is_some())
            .finish()
    }
}

impl Recorder {
    // ---
    /// Format of every recording: 16-bit PCM, 2 channels, 8 kHz.
    pub fn wav_spec() -> WavSpec {
        // ---
        WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    /// Creates `path`, or appends to it if it already holds a recording.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or opened, or if an
    /// existing file has a different format.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        // ---
        let path = path.as_ref().to_path_buf();
        let sink_err = |source| RecorderError::Sink {
            path: path.clone(),
            source,
        };

        let sink = if path.exists() {
            let writer = WavWriter::append(&path).map_err(sink_err)?;
            let spec = writer.spec();
            if spec != Self::wav_spec() {
                return Err(RecorderError::IncompatibleFormat {
                    path,
                    channels: spec.channels,
                    sample_rate: spec.sample_rate,
                    bits: spec.bits_per_sample,
                });
            }
            debug!("Appending to recording {}", path.display());
            writer
        } else {
            debug!("Creating recording {}", path.display());
            WavWriter::create(&path, Self::wav_spec()).map_err(sink_err)?
        };

        Ok(Self {
            ring: RingRecorder::new(),
            sink: Some(sink),
            path,
            started: Instant::now(),
            frames_written: 0,
            scratch: Vec::with_capacity(RECORDING_BUFSIZE * 2),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stereo frames written to the sink so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Sample position corresponding to "now".
    fn now_position(&self) -> i64 {
        // ---
        let micros = self.started.elapsed().as_micros() as i64;
        micros * i64::from(SAMPLE_RATE) / 1_000_000
    }

    /// Records `samples` on `channel`, timed by the wall clock.
    pub fn write(&mut self, samples: &[i16], channel: Channel) -> WriteOutcome {
        // ---
        let end_pos = self.now_position();
        self.write_at(end_pos, samples, channel)
    }

    /// Records `samples` on `channel` ending at an explicit position.
    pub fn write_at(&mut self, end_pos: i64, samples: &[i16], channel: Channel) -> WriteOutcome {
        // ---
        self.ring.write(end_pos, samples, channel)
    }

    /// Writes flushable frames to the sink; see [`RingRecorder::drain`].
    ///
    /// Returns the number of stereo frames written.
    pub fn flush(&mut self, force: bool) -> Result<usize, RecorderError> {
        // ---
        let Some(sink) = self.sink.as_mut() else {
            return Ok(0);
        };

        self.scratch.clear();
        let frames = self.ring.drain(force, &mut self.scratch);
        if frames == 0 {
            return Ok(0);
        }

        let path = &self.path;
        let sink_err = |source| RecorderError::Sink {
            path: path.clone(),
            source,
        };

        for &sample in &self.scratch {
            sink.write_sample(sample).map_err(sink_err)?;
        }
        sink.flush().map_err(sink_err)?;

        self.frames_written += frames as u64;
        Ok(frames)
    }

    /// Flushes everything still buffered and finalizes the file.
    ///
    /// Returns the total number of frames written by this recorder.
    pub fn close(mut self) -> Result<u64, RecorderError> {
        // ---
        self.finish()
    }

    fn finish(&mut self) -> Result<u64, RecorderError> {
        // ---
        let flushed = self.flush(true);

        let Some(sink) = self.sink.take() else {
            return flushed.map(|_| self.frames_written);
        };

        let finalized = sink.finalize().map_err(|source| RecorderError::Sink {
            path: self.path.clone(),
            source,
        });

        flushed?;
        finalized?;
        Ok(self.frames_written)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        // ---
        if self.sink.is_some() {
            if let Err(e) = self.finish() {
                warn!("Failed to finalize recording {}: {}", self.path.display(), e);
            }
        }
    }
}
