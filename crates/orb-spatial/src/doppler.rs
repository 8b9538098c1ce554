//! Doppler pitch shift
//!
//! The source signal is written into a delay line whose read head moves at
//! `factor` samples per output sample. Away from unity the head drifts
//! relative to the nominal delay; at unity it relaxes back so the next
//! shift has room in both directions.

use orb_dsp::{FractionalDelay, Processor};

use crate::position::Vec3;

/// Delay line length in samples
pub const DOPPLER_BUFFER: usize = 2048;

/// Resting delay of the read head, also the reported latency
pub const DOPPLER_NOMINAL_DELAY: usize = 1024;

pub const MIN_FACTOR: f32 = 0.5;
pub const MAX_FACTOR: f32 = 2.0;

/// Read head stays this far from either end of the buffer
const HEAD_MARGIN: f64 = 2.0;

/// Fraction of the offset from nominal recovered per sample at unity
const RELAX_RATE: f64 = 0.0005;

/// `(c + v_l . d) / (c + v_s . d)` with `d` the unit vector from listener
/// to source, clamped to `MIN_FACTOR..=MAX_FACTOR`.
pub fn doppler_factor(
    listener_pos: Vec3,
    listener_vel: Vec3,
    source_pos: Vec3,
    source_vel: Vec3,
    speed_of_sound: f32,
) -> f32 {
    let offset = source_pos - listener_pos;
    if offset.magnitude() < 1e-6 {
        return 1.0;
    }
    let d = offset.normalize_or(Vec3::FORWARD);
    let num = speed_of_sound + listener_vel.dot(d);
    let den = speed_of_sound + source_vel.dot(d);
    if den.abs() < 1e-3 {
        return MAX_FACTOR;
    }
    (num / den).clamp(MIN_FACTOR, MAX_FACTOR)
}

#[derive(Debug, Clone)]
pub struct DopplerShifter {
    line: FractionalDelay,
    read_delay: f64,
    factor: f64,
    target: f64,
    smooth: f64,
}

impl DopplerShifter {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            line: FractionalDelay::new(DOPPLER_BUFFER),
            read_delay: DOPPLER_NOMINAL_DELAY as f64,
            factor: 1.0,
            target: 1.0,
            // ~20 ms glide between block-rate targets
            smooth: 1.0 - (-1.0 / (0.02 * sample_rate.max(1.0))).exp(),
        }
    }

    pub fn set_factor(&mut self, factor: f32) {
        self.target = factor.clamp(MIN_FACTOR, MAX_FACTOR) as f64;
    }

    /// Smoothed factor currently applied
    pub fn factor(&self) -> f32 {
        self.factor as f32
    }

    pub fn read_delay(&self) -> f64 {
        self.read_delay
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        self.line.push(input as f64);
        self.factor += (self.target - self.factor) * self.smooth;

        if (self.factor - 1.0).abs() < 1e-4 {
            self.read_delay += (DOPPLER_NOMINAL_DELAY as f64 - self.read_delay) * RELAX_RATE;
        } else {
            self.read_delay += 1.0 - self.factor;
        }
        self.read_delay = self
            .read_delay
            .clamp(HEAD_MARGIN, DOPPLER_BUFFER as f64 - HEAD_MARGIN);

        self.line.read(self.read_delay) as f32
    }

    pub fn latency(&self) -> usize {
        DOPPLER_NOMINAL_DELAY
    }

    pub fn reset(&mut self) {
        self.line.reset();
        self.read_delay = DOPPLER_NOMINAL_DELAY as f64;
        self.factor = self.target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SPEED_OF_SOUND;

    fn rising_crossings(samples: &[f32]) -> usize {
        samples.windows(2).filter(|w| w[0] <= 0.0 && w[1] > 0.0).count()
    }

    #[test]
    fn test_factor_static_is_unity() {
        let f = doppler_factor(Vec3::ZERO, Vec3::ZERO, Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, SPEED_OF_SOUND);
        assert_eq!(f, 1.0);
    }

    #[test]
    fn test_factor_approaching_source_raises_pitch() {
        let source = Vec3::new(0.0, 0.0, 10.0);
        let toward = Vec3::new(0.0, 0.0, -34.3);
        let f = doppler_factor(Vec3::ZERO, Vec3::ZERO, source, toward, SPEED_OF_SOUND);
        assert!((f - 343.0 / (343.0 - 34.3)).abs() < 1e-4);

        let away = Vec3::new(0.0, 0.0, 34.3);
        let f = doppler_factor(Vec3::ZERO, Vec3::ZERO, source, away, SPEED_OF_SOUND);
        assert!(f < 1.0);
    }

    #[test]
    fn test_factor_moving_listener() {
        let source = Vec3::new(10.0, 0.0, 0.0);
        let f = doppler_factor(Vec3::ZERO, Vec3::new(34.3, 0.0, 0.0), source, Vec3::ZERO, SPEED_OF_SOUND);
        assert!((f - 1.1).abs() < 1e-4);
    }

    #[test]
    fn test_factor_clamped() {
        let source = Vec3::new(0.0, 0.0, 10.0);
        let supersonic = Vec3::new(0.0, 0.0, -1000.0);
        assert_eq!(doppler_factor(Vec3::ZERO, Vec3::ZERO, source, supersonic, SPEED_OF_SOUND), MAX_FACTOR);
        let receding = Vec3::new(0.0, 0.0, 1000.0);
        assert_eq!(doppler_factor(Vec3::ZERO, Vec3::ZERO, source, receding, SPEED_OF_SOUND), MIN_FACTOR);
    }

    #[test]
    fn test_unity_is_pure_delay() {
        let mut shifter = DopplerShifter::new(48000.0);
        let input: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
        let output: Vec<f32> = input.iter().map(|&x| shifter.process(x)).collect();
        for i in DOPPLER_NOMINAL_DELAY..4096 {
            assert!((output[i] - input[i - DOPPLER_NOMINAL_DELAY]).abs() < 1e-6);
        }
        assert_eq!(shifter.latency(), DOPPLER_NOMINAL_DELAY);
    }

    #[test]
    fn test_shift_raises_frequency() {
        let sr = 48000.0;
        let mut shifter = DopplerShifter::new(sr);
        shifter.set_factor(1.2);

        let output: Vec<f32> = (0..6000)
            .map(|n| {
                let x = (2.0 * std::f64::consts::PI * 1000.0 * n as f64 / sr).sin() as f32;
                shifter.process(x)
            })
            .collect();

        // After the glide settles, crossings run ~20% faster than 1 kHz
        let window = &output[2400..4800];
        let crossings = rising_crossings(window) as f32;
        let expected = 1000.0 * 1.2 * window.len() as f32 / sr as f32;
        assert!((crossings - expected).abs() <= expected * 0.06, "{} vs {}", crossings, expected);
    }

    #[test]
    fn test_head_stays_in_buffer() {
        let mut shifter = DopplerShifter::new(48000.0);
        shifter.set_factor(MAX_FACTOR);
        for i in 0..20000 {
            shifter.process((i % 7) as f32);
        }
        assert!(shifter.read_delay() >= HEAD_MARGIN);

        shifter.set_factor(MIN_FACTOR);
        for i in 0..20000 {
            shifter.process((i % 7) as f32);
        }
        assert!(shifter.read_delay() <= DOPPLER_BUFFER as f64 - HEAD_MARGIN);
    }

    #[test]
    fn test_relaxes_to_nominal() {
        let mut shifter = DopplerShifter::new(48000.0);
        shifter.set_factor(1.5);
        for _ in 0..1000 {
            shifter.process(0.0);
        }
        assert!(shifter.read_delay() < DOPPLER_NOMINAL_DELAY as f64);

        shifter.set_factor(1.0);
        for _ in 0..48000 {
            shifter.process(0.0);
        }
        assert!((shifter.read_delay() - DOPPLER_NOMINAL_DELAY as f64).abs() < 1.0);
    }
}
