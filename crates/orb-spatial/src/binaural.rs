//! Binaural rendering for headphones
//!
//! - HRIR convolution (direct-form FIR)
//! - Woodworth ITD when the HRIRs carry no delay of their own
//! - Far-ear ILD as a high shelf
//! - Crossfeed for speaker-like imaging

use orb_dsp::{BiquadFilter, FilterMode, FractionalDelay, MonoProcessor, OnePoleLowPass, Processor};

use crate::hrtf::{HrtfDatabase, MAX_HRIR_LENGTH};
use crate::{HEAD_RADIUS, SPEED_OF_SOUND};

/// Head shadow at 90 degrees, dB
pub const MAX_ILD_DB: f32 = 10.0;

/// Corner of the ILD shelf
const ILD_SHELF_HZ: f64 = 1500.0;

/// Interaural delay room, covers the Woodworth maximum at 192 kHz
const MAX_ITD_SAMPLES: usize = 256;

/// Direction changes below this (degrees) keep the current HRIR
const HRIR_SWITCH_DEGREES: f32 = 1.0;

/// Woodworth spherical-head ITD/ILD model
#[derive(Debug, Clone, Copy)]
pub struct ItdIldModel {
    sample_rate: f32,
    head_radius: f32,
    speed_of_sound: f32,
}

impl ItdIldModel {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            head_radius: HEAD_RADIUS,
            speed_of_sound: SPEED_OF_SOUND,
        }
    }

    /// `r/c * (theta + sin theta)` with theta the lateral angle.
    /// Positive when the source is on the right (the left ear lags).
    pub fn itd_seconds(&self, azimuth_deg: f32) -> f32 {
        let mut theta = azimuth_deg.to_radians();
        // Wrap to -pi..pi, then fold rear directions onto the front
        theta = (theta + std::f32::consts::PI).rem_euclid(std::f32::consts::TAU)
            - std::f32::consts::PI;
        if theta > std::f32::consts::FRAC_PI_2 {
            theta = std::f32::consts::PI - theta;
        } else if theta < -std::f32::consts::FRAC_PI_2 {
            theta = -std::f32::consts::PI - theta;
        }
        (self.head_radius / self.speed_of_sound) * (theta + theta.sin())
    }

    pub fn itd_samples(&self, azimuth_deg: f32) -> f32 {
        self.itd_seconds(azimuth_deg) * self.sample_rate
    }

    /// High-band attenuation of the far ear in dB (negative)
    pub fn ild_db(&self, azimuth_deg: f32, elevation_deg: f32) -> f32 {
        let lateral = azimuth_deg.to_radians().sin() * elevation_deg.to_radians().cos();
        -MAX_ILD_DB * lateral.abs()
    }
}

/// Direct-form FIR on a mirrored history so every tap reads a contiguous
/// slice. Sized for the longest accepted HRIR; never reallocates.
#[derive(Debug, Clone)]
pub struct HrirConvolver {
    left: Vec<f32>,
    right: Vec<f32>,
    length: usize,
    history: Vec<f32>,
    pos: usize,
}

impl Default for HrirConvolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HrirConvolver {
    pub fn new() -> Self {
        let mut left = vec![0.0; MAX_HRIR_LENGTH];
        let mut right = vec![0.0; MAX_HRIR_LENGTH];
        // Pass-through until a response is loaded
        left[0] = 1.0;
        right[0] = 1.0;
        Self {
            left,
            right,
            length: 1,
            history: vec![0.0; MAX_HRIR_LENGTH * 2],
            pos: 0,
        }
    }

    /// Copy a response in. Taps past `MAX_HRIR_LENGTH` are ignored.
    pub fn set_response(&mut self, left: &[f32], right: &[f32]) {
        let length = left.len().max(right.len()).clamp(1, MAX_HRIR_LENGTH);
        self.left[..length].fill(0.0);
        self.right[..length].fill(0.0);
        let l = left.len().min(length);
        let r = right.len().min(length);
        self.left[..l].copy_from_slice(&left[..l]);
        self.right[..r].copy_from_slice(&right[..r]);
        self.length = length;
    }

    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> (f32, f32) {
        self.pos = if self.pos == 0 { MAX_HRIR_LENGTH - 1 } else { self.pos - 1 };
        self.history[self.pos] = input;
        self.history[self.pos + MAX_HRIR_LENGTH] = input;

        let taps = &self.history[self.pos..self.pos + self.length];
        let mut acc_l = 0.0f32;
        let mut acc_r = 0.0f32;
        for ((x, hl), hr) in taps.iter().zip(&self.left[..self.length]).zip(&self.right[..self.length]) {
            acc_l += x * hl;
            acc_r += x * hr;
        }
        (acc_l, acc_r)
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.pos = 0;
    }
}

/// Per-source binaural state
#[derive(Debug, Clone)]
pub struct BinauralVoice {
    model: ItdIldModel,
    convolver: HrirConvolver,
    hrir_index: Option<usize>,
    direction: (f32, f32),
    delay_l: FractionalDelay,
    delay_r: FractionalDelay,
    itd_current: f64,
    itd_target: f64,
    itd_smooth: f64,
    shelf_l: BiquadFilter,
    shelf_r: BiquadFilter,
}

impl BinauralVoice {
    pub fn new(sample_rate: f64) -> Self {
        let shelf = BiquadFilter::with_params(FilterMode::HighShelf, sample_rate, ILD_SHELF_HZ, 1.0, 0.0);
        Self {
            model: ItdIldModel::new(sample_rate as f32),
            convolver: HrirConvolver::new(),
            hrir_index: None,
            direction: (f32::NAN, f32::NAN),
            delay_l: FractionalDelay::new(MAX_ITD_SAMPLES),
            delay_r: FractionalDelay::new(MAX_ITD_SAMPLES),
            itd_current: 0.0,
            itd_target: 0.0,
            // ~5 ms glide
            itd_smooth: 1.0 - (-1.0 / (0.005 * sample_rate)).exp(),
            shelf_l: shelf.clone(),
            shelf_r: shelf,
        }
    }

    /// Block-rate update for a new direction (degrees)
    pub fn update(&mut self, db: &HrtfDatabase, azimuth: f32, elevation: f32) {
        let (last_az, last_el) = self.direction;
        let moved = !last_az.is_finite()
            || angular_difference(last_az, azimuth).abs() >= HRIR_SWITCH_DEGREES
            || (last_el - elevation).abs() >= HRIR_SWITCH_DEGREES;
        if !moved {
            return;
        }
        self.direction = (azimuth, elevation);

        if let Some(index) = db.nearest_index(azimuth, elevation)
            && self.hrir_index != Some(index)
            && let Some(pair) = db.get(index)
        {
            self.convolver.set_response(&pair.left, &pair.right);
            self.hrir_index = Some(index);
        }

        self.itd_target = if db.includes_itd() {
            0.0
        } else {
            self.model.itd_samples(azimuth) as f64
        };

        let ild = self.model.ild_db(azimuth, elevation) as f64;
        let lateral = azimuth.to_radians().sin();
        let (ild_l, ild_r) = if lateral >= 0.0 { (ild, 0.0) } else { (0.0, ild) };
        self.shelf_l.set_gain_db(ild_l);
        self.shelf_r.set_gain_db(ild_r);
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> (f32, f32) {
        let (l, r) = self.convolver.process(input);

        self.itd_current += (self.itd_target - self.itd_current) * self.itd_smooth;
        let lag = self.itd_current.abs();
        let (lag_l, lag_r) = if self.itd_current >= 0.0 { (lag, 0.0) } else { (0.0, lag) };
        let l = self.delay_l.process(l, lag_l);
        let r = self.delay_r.process(r, lag_r);

        let l = self.shelf_l.process_sample(l);
        let r = self.shelf_r.process_sample(r);
        (l, r)
    }

    /// Current interaural delay in samples (positive = left ear lags)
    pub fn itd_samples(&self) -> f64 {
        self.itd_current
    }

    pub fn hrir_length(&self) -> usize {
        self.convolver.length()
    }

    pub fn reset(&mut self) {
        self.convolver.reset();
        self.delay_l.reset();
        self.delay_r.reset();
        self.shelf_l.reset();
        self.shelf_r.reset();
        self.itd_current = self.itd_target;
        self.direction = (f32::NAN, f32::NAN);
        self.hrir_index = None;
    }
}

/// Signed shortest difference `b - a` in degrees
fn angular_difference(a: f32, b: f32) -> f32 {
    (b - a + 180.0).rem_euclid(360.0) - 180.0
}

/// Crossfeed for speaker simulation on headphones
#[derive(Debug, Clone)]
pub struct Crossfeed {
    /// 0 = none, 1 = full
    amount: f32,
    delay_samples: f64,
    delay_left: FractionalDelay,
    delay_right: FractionalDelay,
    /// Head shadow on the crossed signal
    lpf_left: OnePoleLowPass,
    lpf_right: OnePoleLowPass,
}

impl Crossfeed {
    pub fn new(sample_rate: f64) -> Self {
        let delay_samples = 0.0003 * sample_rate;
        Self {
            amount: 0.3,
            delay_samples,
            delay_left: FractionalDelay::new(delay_samples.ceil() as usize + 1),
            delay_right: FractionalDelay::new(delay_samples.ceil() as usize + 1),
            lpf_left: OnePoleLowPass::new(700.0, sample_rate),
            lpf_right: OnePoleLowPass::new(700.0, sample_rate),
        }
    }

    pub fn set_amount(&mut self, amount: f32) {
        self.amount = amount.clamp(0.0, 1.0);
    }

    pub fn amount(&self) -> f32 {
        self.amount
    }

    #[inline]
    pub fn process_frame(&mut self, left: f32, right: f32) -> (f32, f32) {
        self.delay_left.push(left as f64);
        self.delay_right.push(right as f64);
        let crossed_to_left = self.lpf_left.tick(self.delay_right.read(self.delay_samples)) as f32;
        let crossed_to_right = self.lpf_right.tick(self.delay_left.read(self.delay_samples)) as f32;

        let direct = 1.0 - self.amount * 0.5;
        (
            left * direct + crossed_to_left * self.amount,
            right * direct + crossed_to_right * self.amount,
        )
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process_frame(*l, *r);
        }
    }

    pub fn reset(&mut self) {
        self.delay_left.reset();
        self.delay_right.reset();
        self.lpf_left.reset();
        self.lpf_right.reset();
    }
}
