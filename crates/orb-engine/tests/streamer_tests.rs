//! FileStreamer Integration Tests
//!
//! Tests for:
//! - Looping playback position and prefill
//! - Seek targets, clamping and stale-frame flushing
//! - End of data without looping
//! - Channel adaptation of WAV sources

use std::path::{Path, PathBuf};
use std::time::Duration;

use orb_core::BufferPool;
use orb_engine::{FileStreamer, ReadStatus, StreamState, StreamerConfig, playback_channels};
use serial_test::serial;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

const TEST_SAMPLE_RATE: u32 = 48000;
const PRIME_TIMEOUT: Duration = Duration::from_secs(5);

/// Mono float WAV whose sample n holds the value n
fn write_ramp(dir: &Path, name: &str, frames: usize) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..frames {
        writer.write_sample(i as f32).unwrap();
    }
    writer.finalize().unwrap();
    path
}

fn config() -> StreamerConfig {
    StreamerConfig {
        ring_seconds: 0.1,
        chunk_frames: 256,
        idle_wait_ms: 5,
        join_timeout_ms: 500,
    }
}

fn open(path: &Path, channels: usize) -> FileStreamer {
    FileStreamer::open(path, channels, TEST_SAMPLE_RATE, &config(), &BufferPool::new(8)).unwrap()
}

/// Read once the streamer has settled after a seek; reads made while the
/// new position is still priming come back `Pending` and consume nothing
fn read_settled(streamer: &FileStreamer, out: &mut [f32], frames: usize) -> ReadStatus {
    for _ in 0..1000 {
        streamer.wait_primed(frames, PRIME_TIMEOUT);
        match streamer.read(out, frames) {
            ReadStatus::Pending => std::thread::sleep(Duration::from_millis(1)),
            status => return status,
        }
    }
    panic!("streamer never settled");
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOOPING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn test_short_loop_wraps_playback_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "ten.wav", 10);

    let streamer = open(&path, 1);
    streamer.set_loop(true);
    assert!(streamer.wait_primed(35, PRIME_TIMEOUT));

    let mut out = vec![0.0f32; 35];
    assert_eq!(streamer.read(&mut out, 35), ReadStatus::Full);

    let expected: Vec<f32> = (0..35).map(|i| (i % 10) as f32).collect();
    assert_eq!(out, expected);
    assert_eq!(streamer.playback_frame(), 5);
    assert_eq!(streamer.underruns(), 0);
    assert_eq!(streamer.state(), StreamState::Running);
    assert!(!streamer.is_finished());
}

#[test]
#[serial]
fn test_loop_continues_across_many_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "loop.wav", 1000);

    let streamer = open(&path, 1);
    streamer.set_loop(true);

    let mut out = vec![0.0f32; 128];
    let mut next = 0usize;
    for _ in 0..40 {
        assert!(streamer.wait_primed(128, PRIME_TIMEOUT));
        assert_eq!(streamer.read(&mut out, 128), ReadStatus::Full);
        for &s in &out {
            assert_eq!(s, (next % 1000) as f32);
            next += 1;
        }
    }
    assert_eq!(streamer.playback_frame(), (40 * 128 % 1000) as u64);
    assert_eq!(streamer.underruns(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEEK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn test_seek_flushes_stale_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "ramp.wav", 20_000);

    let streamer = open(&path, 1);
    assert!(streamer.wait_primed(1024, PRIME_TIMEOUT));

    let mut out = vec![0.0f32; 64];
    streamer.read(&mut out, 64);
    assert_eq!(out[0], 0.0);

    // The ring is full of pre-seek frames at this point
    assert_eq!(streamer.seek(15_000), 15_000);
    assert_eq!(read_settled(&streamer, &mut out, 64), ReadStatus::Full);
    assert_eq!(out[0], 15_000.0);
    assert_eq!(out[63], 15_063.0);
    assert_eq!(streamer.playback_frame(), 15_064);
}

#[test]
#[serial]
fn test_seek_clamps_to_last_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "ramp.wav", 500);

    let streamer = open(&path, 1);
    assert_eq!(streamer.seek(10_000), 499);

    let mut out = vec![9.0f32; 8];
    assert_eq!(read_settled(&streamer, &mut out, 8), ReadStatus::EndOfData(1));
    assert_eq!(out, [499.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(streamer.playback_frame(), 500);
}

#[test]
#[serial]
fn test_reads_during_pending_seek_are_silent() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "ramp.wav", 20_000);

    let streamer = open(&path, 1);
    assert!(streamer.wait_primed(1024, PRIME_TIMEOUT));

    // Whatever the IO thread has or has not done yet, nothing stale leaks out
    streamer.seek(8_000);
    let mut out = vec![0.0f32; 32];
    match streamer.read(&mut out, 32) {
        ReadStatus::Pending => assert!(out.iter().all(|&s| s == 0.0)),
        ReadStatus::Full => assert_eq!(out[0], 8_000.0),
        other => panic!("unexpected read status {:?}", other),
    }
    assert_eq!(streamer.underruns(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// END OF DATA & CHANNELS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
#[serial]
fn test_end_of_data_pads_without_underrun() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "short.wav", 300);

    let streamer = open(&path, 1);
    // More than the file holds: returns once the end is buffered
    assert!(streamer.wait_primed(301, PRIME_TIMEOUT));

    let mut out = vec![0.0f32; 256];
    assert_eq!(streamer.read(&mut out, 256), ReadStatus::Full);
    assert_eq!(streamer.read(&mut out, 256), ReadStatus::EndOfData(44));
    assert_eq!(out[43], 299.0);
    assert!(out[44..].iter().all(|&s| s == 0.0));

    assert_eq!(streamer.read(&mut out, 256), ReadStatus::EndOfData(0));
    assert!(streamer.is_finished());
    assert_eq!(streamer.state(), StreamState::Finished);
    assert_eq!(streamer.underruns(), 0);
    assert_eq!(streamer.playback_frame(), 300);
}

#[test]
#[serial]
fn test_mono_file_duplicated_to_stereo() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "mono.wav", 1000);
    assert_eq!(playback_channels(1), 1);

    let streamer = open(&path, 2);
    assert_eq!(streamer.channels(), 2);
    assert!(streamer.wait_primed(16, PRIME_TIMEOUT));

    let mut out = vec![0.0f32; 32];
    streamer.read(&mut out, 16);
    for frame in 0..16 {
        assert_eq!(out[frame * 2], frame as f32);
        assert_eq!(out[frame * 2 + 1], frame as f32);
    }
}

#[test]
#[serial]
fn test_close_stops_io_and_silences_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ramp(dir.path(), "ramp.wav", 5000);

    let mut streamer = open(&path, 1);
    let control = streamer.controller();
    assert!(streamer.wait_primed(256, PRIME_TIMEOUT));
    streamer.close();

    assert!(!control.is_open());
    assert_eq!(control.state(), StreamState::Stopped);
    let mut out = vec![1.0f32; 16];
    assert_eq!(streamer.read(&mut out, 16), ReadStatus::Closed);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
#[serial]
fn test_missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = FileStreamer::open(
        dir.path().join("absent.wav"),
        2,
        TEST_SAMPLE_RATE,
        &config(),
        &BufferPool::new(4),
    )
    .unwrap_err();
    assert_eq!(err.code(), orb_core::ErrorCode::NotFound);
}
