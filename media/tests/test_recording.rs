//! Integration tests for the recording path
//!
//! Drives both transcoding directions of a line with an open recorder and
//! reads the resulting WAV file back.

use media::{codec, to_linear, to_wire, LineState, Recorder};

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    // ---
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Both legs written through the codec end up interleaved in the file.
#[test]
fn test_transcoded_legs_reach_wav_file() {
    // ---
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("legs.wav");

    let line = LineState::new();
    line.start_recording(&path).expect("start recording");

    // 20 ms per leg
    let remote = to_linear(&line, &[codec::linear_to_wire(8000); 160]);
    let local = to_wire(&line, &pcm_bytes(&[-8000i16; 160]));

    assert!(remote.recorded.iter().all(|&s| s != 0));
    assert!(local.recorded.iter().all(|&s| s != 0));

    let frames = line.stop_recording().expect("stop").expect("was recording");
    assert!(frames >= 160, "only {frames} frames written");

    let mut reader = hound::WavReader::open(&path).expect("open wav");
    assert_eq!(reader.spec(), Recorder::wav_spec());

    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
    assert_eq!(samples.len() as u64, frames * 2);

    let local_peak = samples.iter().step_by(2).map(|s| s.unsigned_abs()).max();
    let remote_peak = samples.iter().skip(1).step_by(2).map(|s| s.unsigned_abs()).max();
    assert!(local_peak.unwrap_or(0) > 7000);
    assert!(remote_peak.unwrap_or(0) > 7000);
}

/// Muting silences both the wire and the local leg of the recording.
#[test]
fn test_muted_leg_records_silence() {
    // ---
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("muted.wav");

    let line = LineState::new();
    line.set_muted(true);
    line.start_recording(&path).expect("start recording");

    let out = to_wire(&line, &pcm_bytes(&[12000i16; 160]));
    assert!(out.recorded.iter().all(|&s| s.unsigned_abs() <= 8));

    line.stop_recording().expect("stop");

    let mut reader = hound::WavReader::open(&path).expect("open wav");
    assert!(reader
        .samples::<i16>()
        .map(|s| s.expect("sample"))
        .all(|s| s.unsigned_abs() <= 8));
}

/// Without an open recorder nothing is captured.
#[test]
fn test_no_recorder_captures_silence() {
    // ---
    let line = LineState::new();
    let out = to_linear(&line, &[codec::linear_to_wire(20000); 80]);

    assert_eq!(out.data.len(), 160);
    assert!(out.recorded.iter().all(|&s| s == 0));
}
