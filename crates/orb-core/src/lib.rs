//! orb-core: Shared types and process-wide services for the Orbis engine
//!
//! Everything here is a leaf: no other Orbis crate is a dependency.
//!
//! ## Modules
//! - `error` - value-typed error codes and the core error enum
//! - `buffer_pool` - pooled, move-only audio buffers
//! - `clock` - monotonic microsecond clock
//! - `logging` - log levels and the real-time ring logger
//! - `memory` - component footprint registry and memory pressure
//! - `thread` - thread priority and bounded joins

mod error;
pub mod buffer_pool;
pub mod clock;
pub mod logging;
pub mod memory;
pub mod thread;

pub use error::*;
pub use buffer_pool::{AudioBuffer, BufferPool, PoolStats};
pub use clock::{Clock, now_micros};
pub use logging::{LogLevel, RtLogReader, RtLogRecord, RtLogWriter};
pub use memory::{MemoryMonitor, MemoryPressure};

/// Audio sample type used on every real-time path
pub type Sample = f32;

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f32);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f32::NEG_INFINITY);

    /// Values at or below this are treated as silence
    pub const FLOOR: f32 = -144.0;

    #[inline]
    pub fn from_gain(gain: f32) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f32 {
        if self.0 <= Self::FLOOR {
            0.0
        } else {
            10.0_f32.powf(self.0 / 20.0)
        }
    }
}
