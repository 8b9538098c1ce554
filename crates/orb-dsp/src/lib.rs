//! orb-dsp: DSP building blocks for Orbis
//!
//! ## Modules
//! - `biquad` - cookbook biquad (Direct Form I) with lazy coefficient updates
//! - `one_pole` - one-pole low/high-pass and first-order allpass
//! - `delay` - fractional delay line with linear interpolation
//! - `simd` - runtime SIMD detection and denormal protection
//! - `metering` - peak/RMS/clip metering with SIMD kernels

pub mod biquad;
pub mod one_pole;
pub mod delay;
pub mod simd;
pub mod metering;

pub use biquad::{BiquadCoeffs, BiquadFilter, FilterMode};
pub use delay::FractionalDelay;
pub use metering::{LevelMeter, LevelReading, db_to_linear, linear_to_db};
pub use one_pole::{FirstOrderAllpass, OnePoleHighPass, OnePoleLowPass};
pub use simd::{DenormalGuard, SimdLevel, simd_level};

use orb_core::Sample;

/// Trait for all DSP processors
pub trait Processor: Send {
    /// Reset processor state
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}

/// Mono processor trait
pub trait MonoProcessor: Processor {
    /// Process a single sample
    fn process_sample(&mut self, input: Sample) -> Sample;

    /// Process a block of samples
    fn process_block(&mut self, buffer: &mut [Sample]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }
}
