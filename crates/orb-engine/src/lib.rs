//! orb-engine: Real-time multi-track engine for Orbis
//!
//! Provides:
//! - Lock-free SPSC ring and per-source file streaming with seek and loop
//! - Track registry with atomic parameters (volume, pan, mute, solo,
//!   position, EQ)
//! - The mixer: per-track EQ and spatialization, master bus, metering and
//!   recording, driven by the host's device sink through `Engine::render`
//! - Engine configuration and statistics
//!
//! ## Usage
//! ```ignore
//! let engine = orb_engine::create_engine(48000, 512, 2)?;
//! let track = engine.add_track("dialog");
//! engine.load_track(track, "dialog.wav", false)?;
//! engine.start();
//!
//! // Device callback
//! engine.render(&mut out, frames);
//! ```

mod config;
mod error;
mod meter;
mod mixer;
mod ring;
mod stats;
mod streamer;
mod track;

pub use config::*;
pub use error::*;
pub use meter::{AtomicF32, MeterData};
pub use mixer::{Engine, create_engine};
pub use ring::StreamRing;
pub use stats::EngineStats;
pub use streamer::{
    FileStreamer, ReadStatus, StreamControl, StreamState, adapt_channels, playback_channels,
};
pub use track::{FilterSettings, TrackId, TrackParams};
