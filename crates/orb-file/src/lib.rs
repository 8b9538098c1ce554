//! orb-file: Audio file I/O for Orbis
//!
//! Provides:
//! - Source decoding for streaming playback
//!   - WAV (via hound) - native, lossless
//!   - FLAC, MP3, OGG Vorbis, AIFF (via symphonia)
//!   - In-memory sources for synthesized or preloaded audio
//! - Asynchronous recording to WAV with a bounded, drop-oldest queue

mod decoder;
mod error;
pub mod writer;

pub use decoder::*;
pub use error::*;
pub use writer::{
    AsyncWriter, QueueOutcome, RecordingFormat, WriteRequest, WriterConfig, WriterStats,
};
