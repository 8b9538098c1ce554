//! Engine configuration
//!
//! Everything here is validated once at setup; the render path only ever
//! sees a configuration that passed `validate`.

use std::path::Path;
use std::time::Duration;

use orb_core::buffer_pool::{DEFAULT_CLASS_CAPACITY, DEFAULT_RETENTION};
use orb_file::RecordingFormat;
use orb_file::writer::{DEFAULT_ENQUEUE_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use orb_spatial::{OutputLayout, SceneFlags, SpatialMode, SpatialScene};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Largest block the host may request per sub-block
pub const MAX_BUFFER_FRAMES: usize = 8192;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Free buffers kept per (frames, channels) class
    pub class_capacity: usize,
    /// Free buffers per class that idle cleanup never evicts
    pub retention: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            class_capacity: DEFAULT_CLASS_CAPACITY,
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Ring length in seconds at the engine rate
    pub ring_seconds: f32,
    /// Frames decoded per IO-thread pass
    pub chunk_frames: usize,
    /// IO thread re-check interval when idle
    pub idle_wait_ms: u64,
    /// Bound on joining the IO thread at close
    pub join_timeout_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            ring_seconds: 4.0,
            chunk_frames: 2048,
            idle_wait_ms: 100,
            join_timeout_ms: 500,
        }
    }
}

impl StreamerConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Ring capacity in frames, including the slot that is never filled
    pub fn ring_frames(&self, sample_rate: u32, low_memory: bool) -> usize {
        let seconds = if low_memory {
            self.ring_seconds * 0.5
        } else {
            self.ring_seconds
        };
        let frames = (seconds.max(0.0) as f64 * sample_rate as f64) as usize;
        frames.max(self.chunk_frames * 2) + 1
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.chunk_frames == 0 {
            return Err(EngineError::InvalidConfig("streamer chunk_frames must be non-zero".into()));
        }
        if !self.ring_seconds.is_finite() || self.ring_seconds <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "streamer ring_seconds must be positive, got {}",
                self.ring_seconds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub format: RecordingFormat,
    /// Blocks held before drop-oldest kicks in
    pub queue_capacity: usize,
    /// Longest the audio thread waits for the queue lock
    pub enqueue_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            format: RecordingFormat::WavFloat32,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub reference_distance: f32,
    pub doppler: bool,
    pub air_absorption: bool,
    pub crossfeed: bool,
    pub bass_management: bool,
    pub crossover_hz: f32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        let scene = SpatialScene::default();
        Self {
            reference_distance: scene.reference_distance,
            doppler: scene.flags.doppler,
            air_absorption: scene.flags.air_absorption,
            crossfeed: scene.flags.crossfeed,
            bass_management: scene.flags.bass_management,
            crossover_hz: scene.crossover_hz,
        }
    }
}

impl SpatialConfig {
    /// Initial scene for a new engine
    pub fn scene(&self) -> SpatialScene {
        SpatialScene {
            reference_distance: self.reference_distance,
            crossover_hz: self.crossover_hz,
            flags: SceneFlags {
                doppler: self.doppler,
                air_absorption: self.air_absorption,
                crossfeed: self.crossfeed,
                bass_management: self.bass_management,
            },
            ..SpatialScene::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub buffer_frames: usize,
    /// Output channels: 1, 2, 6 (5.1) or 8 (7.1)
    pub channels: usize,
    pub spatial_mode: SpatialMode,
    pub pool: PoolConfig,
    pub streamer: StreamerConfig,
    pub writer: RecorderConfig,
    pub spatial: SpatialConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_frames: 512,
            channels: 2,
            spatial_mode: SpatialMode::Basic,
            pool: PoolConfig::default(),
            streamer: StreamerConfig::default(),
            writer: RecorderConfig::default(),
            spatial: SpatialConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(sample_rate: u32, buffer_frames: usize, channels: usize) -> Self {
        Self {
            sample_rate,
            buffer_frames,
            channels,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        log::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn to_json_string(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(EngineError::InvalidArg(format!(
                "sample rate {} outside {}..={} Hz",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if self.buffer_frames == 0 || self.buffer_frames > MAX_BUFFER_FRAMES {
            return Err(EngineError::InvalidArg(format!(
                "buffer size {} outside 1..={}",
                self.buffer_frames, MAX_BUFFER_FRAMES
            )));
        }
        if OutputLayout::from_channels(self.channels).is_err() {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} output channels (supported: 1, 2, 6, 8)",
                self.channels
            )));
        }
        if self.pool.class_capacity == 0 {
            return Err(EngineError::InvalidConfig("pool class_capacity must be non-zero".into()));
        }
        if self.writer.queue_capacity == 0 {
            return Err(EngineError::InvalidConfig("writer queue_capacity must be non-zero".into()));
        }
        if !(self.spatial.reference_distance > 0.0) {
            return Err(EngineError::InvalidConfig(
                "spatial reference_distance must be positive".into(),
            ));
        }
        self.streamer.validate()
    }

    pub fn layout(&self) -> EngineResult<OutputLayout> {
        Ok(OutputLayout::from_channels(self.channels)?)
    }

    /// Real-time budget of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_frames as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::ErrorCode;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.streamer.chunk_frames, 2048);
        assert_eq!(config.writer.queue_capacity, 256);
        assert_eq!(config.writer.enqueue_timeout_ms, 10);
        assert_eq!(config.spatial.crossover_hz, 80.0);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "sample_rate": 44100, "channels": 6, "streamer": { "ring_seconds": 2.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 6);
        assert_eq!(config.buffer_frames, 512);
        assert_eq!(config.streamer.ring_seconds, 2.0);
        assert_eq!(config.streamer.chunk_frames, 2048);
    }

    #[test]
    fn test_rejects_bad_setup() {
        let err = EngineConfig::new(1000, 512, 2).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);

        let err = EngineConfig::new(48000, 0, 2).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);

        let err = EngineConfig::new(48000, 512, 4).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedFormat);

        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_ring_frames_halved_under_pressure() {
        let streamer = StreamerConfig::default();
        assert_eq!(streamer.ring_frames(44100, false), 44100 * 4 + 1);
        assert_eq!(streamer.ring_frames(44100, true), 44100 * 2 + 1);

        let tiny = StreamerConfig {
            ring_seconds: 0.001,
            ..StreamerConfig::default()
        };
        assert_eq!(tiny.ring_frames(44100, false), 2048 * 2 + 1);
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = EngineConfig::new(96000, 256, 8);
        config.spatial_mode = SpatialMode::Surround;
        config.spatial.doppler = true;
        let json = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_scene_from_spatial_config() {
        let spatial = SpatialConfig {
            reference_distance: 2.0,
            crossfeed: true,
            ..SpatialConfig::default()
        };
        let scene = spatial.scene();
        assert_eq!(scene.reference_distance, 2.0);
        assert!(scene.flags.crossfeed);
        assert_eq!(scene.distance_gain(4.0), 0.5);
    }
}
