//! Biquad filter using Direct Form I
//!
//! Coefficients follow the Audio EQ Cookbook with a bandwidth-derived
//! alpha: `alpha = sin(w) * sinh(ln2 / 2 * BW * w / sin(w))`.
//! Parameter setters only mark the filter dirty; the next `process_*`
//! call recomputes the coefficients once before running.

use orb_core::Sample;
use std::f64::consts::{LN_2, PI};

use crate::{MonoProcessor, Processor};

/// Bandwidth limits in octaves
pub const MIN_BANDWIDTH: f64 = 0.3;
pub const MAX_BANDWIDTH: f64 = 3.0;

/// Lowest usable center/cutoff frequency
pub const MIN_FREQUENCY: f64 = 1.0;

/// Filter response shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum FilterMode {
    LowPass = 0,
    HighPass = 1,
    BandPass = 2,
    Notch = 3,
    Peaking = 4,
    LowShelf = 5,
    HighShelf = 6,
}

impl FilterMode {
    /// Whether `gain_db` affects the response
    pub fn uses_gain(self) -> bool {
        matches!(self, Self::Peaking | Self::LowShelf | Self::HighShelf)
    }
}

impl From<u8> for FilterMode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::HighPass,
            2 => Self::BandPass,
            3 => Self::Notch,
            4 => Self::Peaking,
            5 => Self::LowShelf,
            6 => Self::HighShelf,
            _ => Self::LowPass,
        }
    }
}

/// Normalized biquad coefficients (`a0 = 1`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Pass-through coefficients
    pub const fn bypass() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Cookbook coefficients. Inputs are assumed to be already clamped.
    pub fn calculate(
        mode: FilterMode,
        sample_rate: f64,
        frequency: f64,
        bandwidth: f64,
        gain_db: f64,
    ) -> Self {
        let omega = 2.0 * PI * frequency / sample_rate;
        let sin_w = omega.sin();
        let cos_w = omega.cos();
        let alpha = sin_w * (LN_2 / 2.0 * bandwidth * omega / sin_w).sinh();
        let a = 10.0_f64.powf(gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match mode {
            FilterMode::LowPass => (
                (1.0 - cos_w) / 2.0,
                1.0 - cos_w,
                (1.0 - cos_w) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w,
                1.0 - alpha,
            ),
            FilterMode::HighPass => (
                (1.0 + cos_w) / 2.0,
                -(1.0 + cos_w),
                (1.0 + cos_w) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w,
                1.0 - alpha,
            ),
            // Constant 0 dB peak gain
            FilterMode::BandPass => (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha),
            FilterMode::Notch => (1.0, -2.0 * cos_w, 1.0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha),
            FilterMode::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_w,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w,
                1.0 - alpha / a,
            ),
            FilterMode::LowShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    a * ((a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    (a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha,
                )
            }
            FilterMode::HighShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    a * ((a + 1.0) + (a - 1.0) * cos_w - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos_w + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    (a + 1.0) - (a - 1.0) * cos_w - two_sqrt_a_alpha,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Magnitude response at `frequency`
    pub fn magnitude_at(&self, frequency: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * frequency / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);

        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::bypass()
    }
}

/// Direct Form I delay state for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct DfState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl DfState {
    #[inline(always)]
    fn tick(&mut self, c: &BiquadCoeffs, x: f64) -> f64 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Per-voice biquad with lazy coefficient recompute.
///
/// Channel 0 state serves mono processing and the left channel; channel 1
/// state serves the right channel. Coefficients are shared.
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    mode: FilterMode,
    sample_rate: f64,
    frequency: f64,
    bandwidth: f64,
    gain_db: f64,
    coeffs: BiquadCoeffs,
    state: [DfState; 2],
    dirty: bool,
}

impl BiquadFilter {
    pub fn new(mode: FilterMode, sample_rate: f64) -> Self {
        Self::with_params(mode, sample_rate, 1000.0, 1.0, 0.0)
    }

    pub fn with_params(
        mode: FilterMode,
        sample_rate: f64,
        frequency: f64,
        bandwidth: f64,
        gain_db: f64,
    ) -> Self {
        let mut filter = Self {
            mode,
            sample_rate: sample_rate.max(1.0),
            frequency: 0.0,
            bandwidth: 0.0,
            gain_db: 0.0,
            coeffs: BiquadCoeffs::bypass(),
            state: [DfState::default(); 2],
            dirty: true,
        };
        filter.frequency = filter.clamp_frequency(frequency);
        filter.bandwidth = bandwidth.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH);
        filter.gain_db = gain_db;
        filter
    }

    fn clamp_frequency(&self, frequency: f64) -> f64 {
        frequency.clamp(MIN_FREQUENCY, self.sample_rate * 0.499)
    }

    // ─── Parameters ─────────────────────────────────────────────────────────

    pub fn set_mode(&mut self, mode: FilterMode) {
        if mode != self.mode {
            self.mode = mode;
            self.dirty = true;
        }
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        let frequency = self.clamp_frequency(frequency);
        if frequency != self.frequency {
            self.frequency = frequency;
            self.dirty = true;
        }
    }

    /// Bandwidth in octaves, clamped to 0.3..=3.0
    pub fn set_bandwidth(&mut self, bandwidth: f64) {
        let bandwidth = bandwidth.clamp(MIN_BANDWIDTH, MAX_BANDWIDTH);
        if bandwidth != self.bandwidth {
            self.bandwidth = bandwidth;
            self.dirty = true;
        }
    }

    pub fn set_gain_db(&mut self, gain_db: f64) {
        if gain_db != self.gain_db {
            self.gain_db = gain_db;
            self.dirty = true;
        }
    }

    /// Changing the rate re-clamps the frequency
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        let sample_rate = sample_rate.max(1.0);
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.frequency = self.clamp_frequency(self.frequency);
            self.dirty = true;
        }
    }

    pub fn set_params(&mut self, mode: FilterMode, frequency: f64, bandwidth: f64, gain_db: f64) {
        self.set_mode(mode);
        self.set_frequency(frequency);
        self.set_bandwidth(bandwidth);
        self.set_gain_db(gain_db);
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// True until the next `process_*` call after a parameter change
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Coefficients currently in use (stale while dirty)
    pub fn coefficients(&self) -> BiquadCoeffs {
        self.coeffs
    }

    #[inline]
    fn prepare(&mut self) {
        if self.dirty {
            let gain = if self.mode.uses_gain() { self.gain_db } else { 0.0 };
            self.coeffs = BiquadCoeffs::calculate(
                self.mode,
                self.sample_rate,
                self.frequency,
                self.bandwidth,
                gain,
            );
            self.dirty = false;
        }
    }

    // ─── Processing ─────────────────────────────────────────────────────────

    /// Process one interleaved stereo frame
    #[inline]
    pub fn process_stereo_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        self.prepare();
        let l = self.state[0].tick(&self.coeffs, left as f64);
        let r = self.state[1].tick(&self.coeffs, right as f64);
        (l as Sample, r as Sample)
    }

    /// Process interleaved stereo in place with independent L/R state
    pub fn process_stereo(&mut self, buffer: &mut [Sample]) {
        self.prepare();
        let coeffs = self.coeffs;
        let [left, right] = &mut self.state;
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] = left.tick(&coeffs, frame[0] as f64) as Sample;
            frame[1] = right.tick(&coeffs, frame[1] as f64) as Sample;
        }
    }

    /// Process one lane of an interleaved buffer using the mono state
    pub fn process_strided(&mut self, buffer: &mut [Sample], channels: usize, channel: usize) {
        if channels == 0 || channel >= channels {
            return;
        }
        self.prepare();
        let coeffs = self.coeffs;
        let state = &mut self.state[0];
        for frame in buffer.chunks_exact_mut(channels) {
            frame[channel] = state.tick(&coeffs, frame[channel] as f64) as Sample;
        }
    }
}

impl Processor for BiquadFilter {
    fn reset(&mut self) {
        self.state = [DfState::default(); 2];
    }
}

impl MonoProcessor for BiquadFilter {
    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.prepare();
        self.state[0].tick(&self.coeffs, input as f64) as Sample
    }

    fn process_block(&mut self, buffer: &mut [Sample]) {
        self.prepare();
        let coeffs = self.coeffs;
        let state = &mut self.state[0];
        for sample in buffer.iter_mut() {
            *sample = state.tick(&coeffs, *sample as f64) as Sample;
        }
    }
}
