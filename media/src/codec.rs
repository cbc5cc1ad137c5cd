//! A-law transcoding between the ISDN wire format and linear PCM.
//!
//! ISDN B-channels carry G.711 A-law with every octet transmitted
//! least-significant bit first, so each wire byte is the bit-reversed
//! A-law code. The host audio side uses 16-bit little-endian linear PCM,
//! mono, 8 kHz.
//!
//! All conversions go through lookup tables that are built exactly once
//! (see [`init_tables`]); after that every function here is pure.

use std::sync::LazyLock;
use tracing::warn;

use crate::line::LineState;
use crate::recorder::Channel;

/// Sample rate of the B-channel and of the host audio stream.
pub const SAMPLE_RATE: u32 = 8000;

/// Number of samples over which the line level estimate settles.
pub const LINE_LEVEL_WINDOW: f64 = 400.0;

/// Segment (exponent) for the upper seven magnitude bits.
const EXP_LUT: [u8; 128] = {
    let mut lut = [7u8; 128];
    let mut i = 0;
    while i < 64 {
        lut[i] = match i {
            0..=1 => 1,
            2..=3 => 2,
            4..=7 => 3,
            8..=15 => 4,
            16..=31 => 5,
            _ => 6,
        };
        i += 1;
    }
    lut
};

struct Tables {
    /// Wire byte -> linear sample.
    wire_to_linear: [i16; 256],

    /// Linear sample (as `u16` bit pattern) -> wire byte.
    linear_to_wire: Box<[u8]>,

    /// Wire byte -> unsigned 8-bit magnitude centred on 128, for metering.
    analyze: [u8; 256],
}

impl Tables {
    // ---
    fn build() -> Self {
        // ---
        let mut wire_to_linear = [0i16; 256];
        let mut analyze = [0u8; 256];

        for byte in 0..=255u8 {
            let linear = alaw_to_linear(bit_inverse(byte));
            wire_to_linear[byte as usize] = linear;
            analyze[byte as usize] = ((i32::from(linear) / 256) & 0xFF) as u8 ^ 0x80;
        }

        let linear_to_wire = (0..=u16::MAX)
            .map(|bits| bit_inverse(linear_to_alaw(bits as i16)))
            .collect::<Vec<u8>>()
            .into_boxed_slice();

        Self {
            wire_to_linear,
            linear_to_wire,
            analyze,
        }
    }
}

static TABLES: LazyLock<Tables> = LazyLock::new(Tables::build);

/// Builds the lookup tables if they are not built yet.
///
/// Calling this is optional (the first conversion builds them lazily) but
/// moves the cost out of the audio path. Safe to call any number of times.
pub fn init_tables() {
    // ---
    LazyLock::force(&TABLES);
}

/// Reverses the bit order of an octet (ISDN transmits LSB first).
#[inline]
pub fn bit_inverse(byte: u8) -> u8 {
    byte.reverse_bits()
}

/// Compresses a linear sample to an A-law code (G.711, even bits toggled).
pub fn linear_to_alaw(sample: i16) -> u8 {
    // ---
    let (sign, mag) = if sample < 0 {
        (0x00u32, (-i32::from(sample)).min(32767) as u32)
    } else {
        (0x80u32, sample as u32)
    };

    let mut exponent = u32::from(EXP_LUT[((mag >> 8) & 0x7F) as usize]);
    let mantissa = (mag >> (exponent + 3)) & 0x0F;
    if mag < 0x100 {
        exponent = 0;
    }

    ((sign | (exponent << 4) | mantissa) as u8) ^ 0x55
}

/// Expands an A-law code to a linear sample.
pub fn alaw_to_linear(alaw: u8) -> i16 {
    // ---
    let code = alaw ^ 0x55;
    let mut t = i32::from(code & 0x7F);

    if t < 16 {
        t = (t << 4) + 8;
    } else {
        let seg = (t >> 4) & 0x07;
        t = ((t & 0x0F) << 4) + 0x108;
        t <<= seg - 1;
    }

    if code & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}

/// Wire byte to linear sample.
#[inline]
pub fn wire_to_linear(byte: u8) -> i16 {
    TABLES.wire_to_linear[byte as usize]
}

/// Linear sample to wire byte.
#[inline]
pub fn linear_to_wire(sample: i16) -> u8 {
    TABLES.linear_to_wire[sample as u16 as usize]
}

/// Wire byte that encodes silence.
#[inline]
pub fn wire_silence() -> u8 {
    linear_to_wire(0)
}

#[inline]
fn magnitude(byte: u8) -> i32 {
    (i32::from(TABLES.analyze[byte as usize]) - 128).abs()
}

/// Output of one transcoding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcoded {
    // ---
    /// Converted payload (linear PCM bytes or wire bytes).
    pub data: Vec<u8>,

    /// Linear samples handed to the recorder; silence when not recording.
    pub recorded: Vec<i16>,
}

/// Converts a B-channel payload to 16-bit little-endian PCM.
///
/// Feeds the remote leg of the line's recorder (if one is open) and
/// updates the incoming line level.
pub fn to_linear(line: &LineState, input: &[u8]) -> Transcoded {
    // ---
    let mut data = Vec::with_capacity(input.len() * 2);
    let mut recorded = Vec::with_capacity(input.len());
    let mut peak = 0;

    let mut recorder = line.recorder.lock();
    let recording = recorder.is_some();

    for &byte in input {
        let sample = wire_to_linear(byte);
        recorded.push(if recording { sample } else { 0 });
        peak = peak.max(magnitude(byte));
        data.extend_from_slice(&sample.to_le_bytes());
    }

    if let Some(rec) = recorder.as_mut() {
        rec.write(&recorded, Channel::Remote);
    }
    drop(recorder);

    line.update_level_in(peak, input.len());

    Transcoded { data, recorded }
}

/// Converts 16-bit little-endian PCM to a B-channel payload.
///
/// A muted line sends silence regardless of the input. Feeds the local leg
/// of the line's recorder and updates the outgoing line level. A trailing
/// odd byte is ignored.
pub fn to_wire(line: &LineState, input: &[u8]) -> Transcoded {
    // ---
    if input.len() % 2 != 0 {
        warn!("Dropping trailing odd byte of {}-byte PCM buffer", input.len());
    }

    let samples = input.len() / 2;
    let mut data = Vec::with_capacity(samples);
    let mut recorded = Vec::with_capacity(samples);
    let mut peak = 0;

    let muted = line.is_muted();
    let mut recorder = line.recorder.lock();
    let recording = recorder.is_some();

    for pair in input.chunks_exact(2) {
        let byte = if muted {
            wire_silence()
        } else {
            linear_to_wire(i16::from_le_bytes([pair[0], pair[1]]))
        };

        peak = peak.max(magnitude(byte));
        recorded.push(if recording { wire_to_linear(byte) } else { 0 });
        data.push(byte);
    }

    if let Some(rec) = recorder.as_mut() {
        rec.write(&recorded, Channel::Local);
    }
    drop(recorder);

    line.update_level_out(peak, samples);

    Transcoded { data, recorded }
}

/// Line level update: exponential moving average of the buffer peak
/// (normalised to 0.0..=1.0) with a weight of `samples / 400`, capped at 1.
pub(crate) fn smoothed_level(previous: f64, peak: i32, samples: usize) -> f64 {
    // ---
    let ratio = (samples as f64 / LINE_LEVEL_WINDOW).min(1.0);
    previous * (1.0 - ratio) + (f64::from(peak) / 128.0) * ratio
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pcm_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn test_known_alaw_codes() {
        // ---
        // G.711 reference points (even bits toggled)
        assert_eq!(linear_to_alaw(0), 0xD5);
        assert_eq!(linear_to_alaw(-1), 0x55);
        assert_eq!(linear_to_alaw(i16::MAX), 0xAA);
        assert_eq!(linear_to_alaw(i16::MIN), 0x2A);

        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32256);
        assert_eq!(alaw_to_linear(0x2A), -32256);
    }

    #[test]
    fn test_bit_inverse() {
        // ---
        assert_eq!(bit_inverse(0x01), 0x80);
        assert_eq!(bit_inverse(0xF0), 0x0F);
        assert_eq!(bit_inverse(0b1010_0110), 0b0110_0101);
        for b in 0..=255u8 {
            assert_eq!(bit_inverse(bit_inverse(b)), b);
        }
    }

    #[test]
    fn test_every_wire_code_survives_round_trip() {
        // ---
        let line = LineState::new();
        let wire: Vec<u8> = (0..=255u8).collect();

        let linear = to_linear(&line, &wire);
        let back = to_wire(&line, &linear.data);

        assert_eq!(back.data, wire);
    }

    #[test]
    fn test_linear_round_trip_is_quantisation_stable() {
        // ---
        let line = LineState::new();
        let input: Vec<i16> = (-32768..=32767).step_by(97).map(|v| v as i16).collect();

        let first = to_linear(&line, &to_wire(&line, &pcm_bytes(&input)).data);
        let second = to_linear(&line, &to_wire(&line, &first.data).data);

        assert_eq!(first.data, second.data);

        // Quantisation error of A-law is bounded by half the largest step
        for (orig, q) in input.iter().zip(pcm_samples(&first.data)) {
            assert!((i32::from(*orig) - i32::from(q)).abs() <= 512);
        }
    }

    #[test]
    fn test_to_linear_doubles_length() {
        // ---
        let line = LineState::new();
        let out = to_linear(&line, &[wire_silence(); 160]);

        assert_eq!(out.data.len(), 320);
        assert_eq!(out.recorded, vec![0i16; 160]);
    }

    #[test]
    fn test_muted_line_sends_silence() {
        // ---
        let line = LineState::new();
        line.set_muted(true);

        let loud = pcm_bytes(&[20000i16; 80]);
        let out = to_wire(&line, &loud);

        assert_eq!(out.data, vec![wire_silence(); 80]);
        assert_eq!(line.level_out(), 0.0);
    }

    #[test]
    fn test_odd_trailing_byte_is_ignored() {
        // ---
        let line = LineState::new();
        let out = to_wire(&line, &[0, 0, 0]);
        assert_eq!(out.data.len(), 1);
    }

    #[test]
    fn test_line_level_tracks_loud_input() {
        // ---
        let line = LineState::new();
        let loud = pcm_bytes(&[30000i16; 400]);

        to_wire(&line, &loud);
        assert!(line.level_out() > 0.9, "level was {}", line.level_out());

        // A short silent buffer only partially decays the estimate
        to_wire(&line, &pcm_bytes(&[0i16; 100]));
        let level = line.level_out();
        assert!(level > 0.6 && level < 0.8, "level was {level}");
    }

    #[test]
    fn test_silence_converges_to_zero() {
        // ---
        let line = LineState::new();
        to_linear(&line, &[linear_to_wire(25000); 160]);
        assert!(line.level_in() > 0.0);

        // 10 ms blocks of silence at 8 kHz
        for _ in 0..20 {
            let out = to_linear(&line, &[wire_silence(); 80]);
            to_wire(&line, &out.data);
        }

        assert!(line.level_in() < 0.01, "level was {}", line.level_in());
        assert!(line.level_out() < 0.01, "level was {}", line.level_out());
    }

    #[test]
    fn test_smoothed_level_ratio_is_capped() {
        // ---
        assert_eq!(smoothed_level(0.5, 128, 4000), 1.0);
        assert_eq!(smoothed_level(0.5, 0, 0), 0.5);
    }
}
