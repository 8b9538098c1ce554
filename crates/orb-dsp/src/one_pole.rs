//! One-pole filters
//!
//! Cheap smoothing and tone shaping used by the spatial stages
//! (air absorption, crossfeed, early reflections, ILD head shadow).

use orb_core::Sample;
use std::f64::consts::PI;

use crate::{MonoProcessor, Processor};

#[inline]
fn lowpass_coeff(cutoff: f64, sample_rate: f64) -> f64 {
    let cutoff = cutoff.clamp(1.0, sample_rate * 0.49);
    1.0 - (-2.0 * PI * cutoff / sample_rate).exp()
}

/// `y += a * (x - y)` with `a = 1 - exp(-2*pi*fc/sr)`
#[derive(Debug, Clone)]
pub struct OnePoleLowPass {
    sample_rate: f64,
    cutoff: f64,
    coeff: f64,
    z1: f64,
}

impl OnePoleLowPass {
    pub fn new(cutoff: f64, sample_rate: f64) -> Self {
        let sample_rate = sample_rate.max(1.0);
        Self {
            sample_rate,
            cutoff,
            coeff: lowpass_coeff(cutoff, sample_rate),
            z1: 0.0,
        }
    }

    pub fn set_cutoff(&mut self, cutoff: f64) {
        if cutoff != self.cutoff {
            self.cutoff = cutoff;
            self.coeff = lowpass_coeff(cutoff, self.sample_rate);
        }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Current output without advancing
    pub fn value(&self) -> f64 {
        self.z1
    }

    /// Advance in f64 without the f32 round-trip
    #[inline]
    pub fn tick(&mut self, input: f64) -> f64 {
        self.z1 += self.coeff * (input - self.z1);
        self.z1
    }
}

impl Processor for OnePoleLowPass {
    fn reset(&mut self) {
        self.z1 = 0.0;
    }
}

impl MonoProcessor for OnePoleLowPass {
    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.tick(input as f64) as Sample
    }
}

/// Input minus its one-pole low-passed copy
#[derive(Debug, Clone)]
pub struct OnePoleHighPass {
    lowpass: OnePoleLowPass,
}

impl OnePoleHighPass {
    pub fn new(cutoff: f64, sample_rate: f64) -> Self {
        Self {
            lowpass: OnePoleLowPass::new(cutoff, sample_rate),
        }
    }

    pub fn set_cutoff(&mut self, cutoff: f64) {
        self.lowpass.set_cutoff(cutoff);
    }

    #[inline]
    pub fn tick(&mut self, input: f64) -> f64 {
        input - self.lowpass.tick(input)
    }
}

impl Processor for OnePoleHighPass {
    fn reset(&mut self) {
        self.lowpass.reset();
    }
}

impl MonoProcessor for OnePoleHighPass {
    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.tick(input as f64) as Sample
    }
}

/// First-order allpass: unity magnitude, phase shift around `frequency`
#[derive(Debug, Clone)]
pub struct FirstOrderAllpass {
    sample_rate: f64,
    coeff: f64,
    x1: f64,
    y1: f64,
}

impl FirstOrderAllpass {
    pub fn new(frequency: f64, sample_rate: f64) -> Self {
        let mut ap = Self {
            sample_rate: sample_rate.max(1.0),
            coeff: 0.0,
            x1: 0.0,
            y1: 0.0,
        };
        ap.set_frequency(frequency);
        ap
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        let frequency = frequency.clamp(1.0, self.sample_rate * 0.49);
        let t = (PI * frequency / self.sample_rate).tan();
        self.coeff = (t - 1.0) / (t + 1.0);
    }

    #[inline]
    pub fn tick(&mut self, input: f64) -> f64 {
        let y = self.coeff * input + self.x1 - self.coeff * self.y1;
        self.x1 = input;
        self.y1 = y;
        y
    }
}

impl Processor for FirstOrderAllpass {
    fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

impl MonoProcessor for FirstOrderAllpass {
    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.tick(input as f64) as Sample
    }
}
