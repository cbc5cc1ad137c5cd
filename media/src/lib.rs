//! Audio path of the CAPI phone
//!
//! Transcodes between the ISDN B-channel format (bit-reversed A-law) and
//! 16-bit linear PCM, meters line levels and records both legs of a call
//! into a stereo WAV file.

pub mod codec;
pub mod line;
pub mod recorder;

pub use codec::{init_tables, to_linear, to_wire, Transcoded, SAMPLE_RATE};
pub use line::LineState;
pub use recorder::{Channel, Recorder, RecorderError, RingRecorder, WriteOutcome};
