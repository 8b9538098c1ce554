//! Recorded WAV layout: a plain 16-byte `fmt ` chunk with format tag 3
//! for float32 (tag 1 for integer PCM), sizes patched on close, and files
//! that standard readers accept.

use std::path::Path;

use orb_core::BufferPool;
use orb_file::{AsyncWriter, RecordingFormat, WriterConfig};

const FRAMES: usize = 64;

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn record(path: &Path, format: RecordingFormat, channels: usize, value: f32) {
    let pool = BufferPool::new(2);
    let config = WriterConfig {
        sample_rate: 44100,
        channels: channels as u16,
        format,
        ..Default::default()
    };
    let mut writer = AsyncWriter::start(path, config).unwrap();
    let mut buffer = pool.acquire(FRAMES, channels);
    buffer.as_mut_slice().fill(value);
    writer.queue(buffer);
    let stats = writer.stop();
    assert_eq!(stats.frames_written, FRAMES as u64);
    assert!(!stats.failed);
}

#[test]
fn test_float32_header_is_ieee_float() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("float.wav");
    record(&path, RecordingFormat::WavFloat32, 2, 0.25);

    let bytes = std::fs::read(&path).unwrap();
    let data_bytes = FRAMES * 2 * 4;
    assert_eq!(bytes.len(), 44 + data_bytes);

    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(u32_at(&bytes, 4) as usize, bytes.len() - 8);
    assert_eq!(&bytes[8..12], b"WAVE");
    assert_eq!(&bytes[12..16], b"fmt ");
    assert_eq!(u32_at(&bytes, 16), 16, "fmt chunk length");
    assert_eq!(u16_at(&bytes, 20), 3, "IEEE float format tag");
    assert_eq!(u16_at(&bytes, 22), 2);
    assert_eq!(u32_at(&bytes, 24), 44100);
    assert_eq!(u32_at(&bytes, 28), 44100 * 8);
    assert_eq!(u16_at(&bytes, 32), 8);
    assert_eq!(u16_at(&bytes, 34), 32);
    assert_eq!(&bytes[36..40], b"data");
    assert_eq!(u32_at(&bytes, 40) as usize, data_bytes);
    assert_eq!(&bytes[44..48], &0.25f32.to_le_bytes());

    let reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
    assert_eq!(reader.duration() as usize, FRAMES);
}

#[test]
fn test_pcm16_header_is_integer_pcm() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pcm16.wav");
    record(&path, RecordingFormat::WavPcm16, 1, -1.0);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(u32_at(&bytes, 16), 16);
    assert_eq!(u16_at(&bytes, 20), 1);
    assert_eq!(u16_at(&bytes, 34), 16);
    assert_eq!(u32_at(&bytes, 40) as usize, FRAMES * 2);

    let mut reader = hound::WavReader::open(&path).unwrap();
    let first = reader.samples::<i16>().next().unwrap().unwrap();
    assert_eq!(first, -32_767);
}
