//! Orbis spatial audio
//!
//! Per-source pipeline from a listener-relative position to the output
//! layout:
//!
//! ## Distance
//! - Inverse-distance attenuation with a reference distance
//! - Air absorption as a distance-driven one-pole low-pass
//! - Doppler through a fractional-delay read head
//!
//! ## Binaural
//! - Nearest-direction HRIR convolution
//! - Woodworth ITD, far-ear ILD shelf
//! - Headphone crossfeed
//!
//! ## Surround
//! - Stereo, 5.1 and 7.1 speaker rings with 2D VBAP
//! - Stereo up-mix and ITU down-mix
//! - Bass management into the LFE channel
//!
//! Coordinates are right-handed with x to the right, y up and z forward.
//! Azimuth is positive to the right, elevation positive upward.

pub mod air;
pub mod binaural;
pub mod doppler;
pub mod hrtf;
pub mod processor;
pub mod surround;

mod error;
mod position;
mod scene;

pub use error::{SpatialError, SpatialResult};
pub use hrtf::{HrirPair, HrtfDatabase};
pub use position::{Listener, SpatialSource, Spherical, Vec3};
pub use processor::{SpatialMode, SpatialProcessor, SpatialTrack};
pub use scene::{ReverbSettings, Room, SceneFlags, SpatialScene};
pub use surround::OutputLayout;

/// Speed of sound in air, m/s
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Average adult head radius in meters
pub const HEAD_RADIUS: f32 = 0.0875;
