//! Air absorption
//!
//! High frequencies lose `a(h) * d * (f / 1 kHz)^2` dB over `d` meters,
//! with `a(h) = 0.005 * (1.5 - h)` for relative humidity `h`. The loss is
//! approximated by a one-pole low-pass whose corner is where it reaches
//! 3 dB.

use orb_dsp::{OnePoleLowPass, Processor};

const MIN_CUTOFF_HZ: f64 = 1000.0;
const MAX_CUTOFF_HZ: f64 = 20000.0;

/// Absorption coefficient in dB per meter at 1 kHz
pub fn absorption_coefficient(humidity: f32) -> f32 {
    0.005 * (1.5 - humidity.clamp(0.0, 1.0))
}

/// Absorption in dB at `frequency` after `distance` meters
pub fn absorption_db(distance: f32, humidity: f32, frequency: f32) -> f32 {
    let khz = frequency / 1000.0;
    absorption_coefficient(humidity) * distance.max(0.0) * khz * khz
}

/// Low-pass corner for the given distance, or `None` when the loss is
/// inaudible across the band
pub fn cutoff_hz(distance: f32, humidity: f32, sample_rate: f64) -> Option<f64> {
    let loss = absorption_coefficient(humidity) as f64 * distance.max(0.0) as f64;
    if loss <= 0.0 {
        return None;
    }
    let ceiling = MAX_CUTOFF_HZ.min(sample_rate * 0.45);
    let cutoff = 1000.0 * (3.0 / loss).sqrt();
    if cutoff >= ceiling {
        None
    } else {
        Some(cutoff.max(MIN_CUTOFF_HZ))
    }
}

#[derive(Debug, Clone)]
pub struct AirAbsorption {
    sample_rate: f64,
    filter: OnePoleLowPass,
    active: bool,
}

impl AirAbsorption {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            filter: OnePoleLowPass::new(MAX_CUTOFF_HZ, sample_rate),
            active: false,
        }
    }

    /// Block-rate update from the current source distance
    pub fn update(&mut self, distance: f32, humidity: f32) {
        match cutoff_hz(distance, humidity, self.sample_rate) {
            Some(cutoff) => {
                self.active = true;
                self.filter.set_cutoff(cutoff);
            }
            None => self.active = false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cutoff(&self) -> Option<f64> {
        self.active.then(|| self.filter.cutoff())
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        // Filter state advances even while bypassed
        let filtered = self.filter.tick(input as f64) as f32;
        if self.active { filtered } else { input }
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }
}
