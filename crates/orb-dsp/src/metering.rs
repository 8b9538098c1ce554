//! Peak/RMS level metering
//!
//! Kernels:
//! - Scalar fallback, always available
//! - SSE2 (x86_64 baseline) and AVX, chosen at construction from CPU detection
//! - NEON on aarch64
//!
//! Squares accumulate in f64 so long blocks do not lose precision.
//! Interleaved stereo kernels rely on even lanes holding L and odd lanes R.

use orb_core::Sample;

use crate::simd::{SimdLevel, simd_level};

/// Any |sample| at or above this marks the block as clipping
pub const CLIP_THRESHOLD: f32 = 0.99;

/// Silence floor for dB conversions
pub const DB_FLOOR: f32 = -144.0;

/// Linear amplitude to dBFS, floored at `DB_FLOOR`
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return DB_FLOOR;
    }
    (20.0 * linear.log10()).max(DB_FLOOR)
}

/// dBFS to linear amplitude; `DB_FLOOR` and below map to 0
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db <= DB_FLOOR {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Result of metering one block
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LevelReading {
    pub peak: f32,
    pub rms: f32,
    pub peak_l: f32,
    pub peak_r: f32,
    pub rms_l: f32,
    pub rms_r: f32,
    pub clipping: bool,
}

impl LevelReading {
    pub fn peak_db(&self) -> f32 {
        linear_to_db(self.peak)
    }

    pub fn rms_db(&self) -> f32 {
        linear_to_db(self.rms)
    }
}

/// Raw kernel output for one interleaved lane pair
#[derive(Debug, Clone, Copy, Default)]
struct StereoSums {
    peak_l: f32,
    peak_r: f32,
    sum_l: f64,
    sum_r: f64,
}

#[inline]
fn rms_from(sum: f64, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt() as f32
    }
}

/// Block meter bound to one kernel set
#[derive(Debug, Clone, Copy)]
pub struct LevelMeter {
    level: SimdLevel,
}

impl LevelMeter {
    /// Meter using the best kernels for this CPU
    pub fn new() -> Self {
        Self {
            level: simd_level(),
        }
    }

    /// Meter restricted to the scalar kernels
    pub fn scalar() -> Self {
        Self {
            level: SimdLevel::Scalar,
        }
    }

    pub fn simd_level(&self) -> SimdLevel {
        self.level
    }

    /// Meter `frames` frames of interleaved audio with `channels` channels.
    ///
    /// Mono reports the same value for both sides. For more than two
    /// channels, L/R are channels 0 and 1 and peak/RMS cover every channel.
    pub fn levels(&self, samples: &[Sample], frames: usize, channels: usize) -> LevelReading {
        let count = (frames * channels).min(samples.len());
        let samples = &samples[..count];
        match channels {
            0 => LevelReading::default(),
            1 => self.levels_mono(samples),
            2 => self.levels_stereo(samples),
            _ => self.levels_multichannel(samples, channels),
        }
    }

    pub fn levels_mono(&self, samples: &[Sample]) -> LevelReading {
        if samples.is_empty() {
            return LevelReading::default();
        }
        let (peak, sum) = self.mono_sums(samples);
        let rms = rms_from(sum, samples.len());
        LevelReading {
            peak,
            rms,
            peak_l: peak,
            peak_r: peak,
            rms_l: rms,
            rms_r: rms,
            clipping: peak >= CLIP_THRESHOLD,
        }
    }

    /// Interleaved L/R; a trailing odd sample is ignored
    pub fn levels_stereo(&self, samples: &[Sample]) -> LevelReading {
        let samples = &samples[..samples.len() & !1];
        let frames = samples.len() / 2;
        if frames == 0 {
            return LevelReading::default();
        }
        let sums = self.stereo_sums(samples);
        let peak = sums.peak_l.max(sums.peak_r);
        LevelReading {
            peak,
            rms: rms_from(sums.sum_l + sums.sum_r, samples.len()),
            peak_l: sums.peak_l,
            peak_r: sums.peak_r,
            rms_l: rms_from(sums.sum_l, frames),
            rms_r: rms_from(sums.sum_r, frames),
            clipping: peak >= CLIP_THRESHOLD,
        }
    }

    pub fn levels_multichannel(&self, samples: &[Sample], channels: usize) -> LevelReading {
        if channels < 2 {
            return self.levels_mono(samples);
        }
        let samples = &samples[..samples.len() - samples.len() % channels];
        let frames = samples.len() / channels;
        if frames == 0 {
            return LevelReading::default();
        }

        let (peak, sum) = self.mono_sums(samples);

        let mut side = StereoSums::default();
        for frame in samples.chunks_exact(channels) {
            let (l, r) = (frame[0], frame[1]);
            side.peak_l = side.peak_l.max(l.abs());
            side.peak_r = side.peak_r.max(r.abs());
            side.sum_l += l as f64 * l as f64;
            side.sum_r += r as f64 * r as f64;
        }

        LevelReading {
            peak,
            rms: rms_from(sum, samples.len()),
            peak_l: side.peak_l,
            peak_r: side.peak_r,
            rms_l: rms_from(side.sum_l, frames),
            rms_r: rms_from(side.sum_r, frames),
            clipping: peak >= CLIP_THRESHOLD,
        }
    }

    fn mono_sums(&self, samples: &[Sample]) -> (f32, f64) {
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx => {
                // SAFETY: `Avx` is only selected when the CPU reports AVX
                unsafe { x86_impl::mono_avx(samples) }
            }
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Sse2 => x86_impl::mono_sse2(samples),
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => neon_impl::mono(samples),
            _ => mono_scalar(samples),
        }
    }

    fn stereo_sums(&self, samples: &[Sample]) -> StereoSums {
        match self.level {
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx => {
                // SAFETY: `Avx` is only selected when the CPU reports AVX
                unsafe { x86_impl::stereo_avx(samples) }
            }
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Sse2 => x86_impl::stereo_sse2(samples),
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => neon_impl::stereo(samples),
            _ => stereo_scalar(samples),
        }
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCALAR
// ═══════════════════════════════════════════════════════════════════════════════

fn mono_scalar(samples: &[Sample]) -> (f32, f64) {
    let mut peak = 0.0f32;
    let mut sum = 0.0f64;
    for &s in samples {
        peak = peak.max(s.abs());
        sum += s as f64 * s as f64;
    }
    (peak, sum)
}

fn stereo_scalar(samples: &[Sample]) -> StereoSums {
    let mut out = StereoSums::default();
    for frame in samples.chunks_exact(2) {
        let (l, r) = (frame[0], frame[1]);
        out.peak_l = out.peak_l.max(l.abs());
        out.peak_r = out.peak_r.max(r.abs());
        out.sum_l += l as f64 * l as f64;
        out.sum_r += r as f64 * r as f64;
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// x86_64
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_arch = "x86_64")]
mod x86_impl {
    use super::{StereoSums, mono_scalar, stereo_scalar};
    use std::arch::x86_64::*;

    /// SSE2 is part of the x86_64 baseline, so these are safe to call
    pub(super) fn mono_sse2(samples: &[f32]) -> (f32, f64) {
        let chunks = samples.chunks_exact(4);
        let (rest_peak, rest_sum) = mono_scalar(chunks.remainder());

        // SAFETY: SSE2 is always available on x86_64; loads are unaligned
        unsafe {
            let sign = _mm_set1_ps(-0.0);
            let mut peak = _mm_setzero_ps();
            let mut sum = _mm_setzero_pd();
            for chunk in chunks {
                let v = _mm_loadu_ps(chunk.as_ptr());
                peak = _mm_max_ps(peak, _mm_andnot_ps(sign, v));
                let lo = _mm_cvtps_pd(v);
                let hi = _mm_cvtps_pd(_mm_movehl_ps(v, v));
                sum = _mm_add_pd(sum, _mm_add_pd(_mm_mul_pd(lo, lo), _mm_mul_pd(hi, hi)));
            }

            let mut p = [0.0f32; 4];
            _mm_storeu_ps(p.as_mut_ptr(), peak);
            let mut s = [0.0f64; 2];
            _mm_storeu_pd(s.as_mut_ptr(), sum);

            let peak = p.iter().copied().fold(rest_peak, f32::max);
            (peak, s[0] + s[1] + rest_sum)
        }
    }

    pub(super) fn stereo_sse2(samples: &[f32]) -> StereoSums {
        let chunks = samples.chunks_exact(4);
        let rest = stereo_scalar(chunks.remainder());

        // SAFETY: as above
        unsafe {
            let sign = _mm_set1_ps(-0.0);
            let mut peak = _mm_setzero_ps();
            let mut sum = _mm_setzero_pd();
            for chunk in chunks {
                let v = _mm_loadu_ps(chunk.as_ptr());
                peak = _mm_max_ps(peak, _mm_andnot_ps(sign, v));
                // [L0 R0] and [L1 R1]
                let lo = _mm_cvtps_pd(v);
                let hi = _mm_cvtps_pd(_mm_movehl_ps(v, v));
                sum = _mm_add_pd(sum, _mm_add_pd(_mm_mul_pd(lo, lo), _mm_mul_pd(hi, hi)));
            }

            let mut p = [0.0f32; 4];
            _mm_storeu_ps(p.as_mut_ptr(), peak);
            let mut s = [0.0f64; 2];
            _mm_storeu_pd(s.as_mut_ptr(), sum);

            StereoSums {
                peak_l: p[0].max(p[2]).max(rest.peak_l),
                peak_r: p[1].max(p[3]).max(rest.peak_r),
                sum_l: s[0] + rest.sum_l,
                sum_r: s[1] + rest.sum_r,
            }
        }
    }

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn mono_avx(samples: &[f32]) -> (f32, f64) {
        let chunks = samples.chunks_exact(8);
        let (rest_peak, rest_sum) = mono_scalar(chunks.remainder());

        // SAFETY: caller guarantees AVX; loads are unaligned
        unsafe {
            let sign = _mm256_set1_ps(-0.0);
            let mut peak = _mm256_setzero_ps();
            let mut sum = _mm256_setzero_pd();
            for chunk in chunks {
                let v = _mm256_loadu_ps(chunk.as_ptr());
                peak = _mm256_max_ps(peak, _mm256_andnot_ps(sign, v));
                let lo = _mm256_cvtps_pd(_mm256_castps256_ps128(v));
                let hi = _mm256_cvtps_pd(_mm256_extractf128_ps::<1>(v));
                sum = _mm256_add_pd(sum, _mm256_add_pd(_mm256_mul_pd(lo, lo), _mm256_mul_pd(hi, hi)));
            }

            let mut p = [0.0f32; 8];
            _mm256_storeu_ps(p.as_mut_ptr(), peak);
            let mut s = [0.0f64; 4];
            _mm256_storeu_pd(s.as_mut_ptr(), sum);

            let peak = p.iter().copied().fold(rest_peak, f32::max);
            (peak, s.iter().sum::<f64>() + rest_sum)
        }
    }

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn stereo_avx(samples: &[f32]) -> StereoSums {
        let chunks = samples.chunks_exact(8);
        let rest = stereo_scalar(chunks.remainder());

        // SAFETY: caller guarantees AVX; loads are unaligned
        unsafe {
            let sign = _mm256_set1_ps(-0.0);
            let mut peak = _mm256_setzero_ps();
            let mut sum = _mm256_setzero_pd();
            for chunk in chunks {
                let v = _mm256_loadu_ps(chunk.as_ptr());
                peak = _mm256_max_ps(peak, _mm256_andnot_ps(sign, v));
                // [L0 R0 L1 R1] and [L2 R2 L3 R3]
                let lo = _mm256_cvtps_pd(_mm256_castps256_ps128(v));
                let hi = _mm256_cvtps_pd(_mm256_extractf128_ps::<1>(v));
                sum = _mm256_add_pd(sum, _mm256_add_pd(_mm256_mul_pd(lo, lo), _mm256_mul_pd(hi, hi)));
            }

            let mut p = [0.0f32; 8];
            _mm256_storeu_ps(p.as_mut_ptr(), peak);
            let mut s = [0.0f64; 4];
            _mm256_storeu_pd(s.as_mut_ptr(), sum);

            StereoSums {
                peak_l: p[0].max(p[2]).max(p[4]).max(p[6]).max(rest.peak_l),
                peak_r: p[1].max(p[3]).max(p[5]).max(p[7]).max(rest.peak_r),
                sum_l: s[0] + s[2] + rest.sum_l,
                sum_r: s[1] + s[3] + rest.sum_r,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// aarch64
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_arch = "aarch64")]
mod neon_impl {
    use super::{StereoSums, mono_scalar, stereo_scalar};
    use std::arch::aarch64::*;

    pub(super) fn mono(samples: &[f32]) -> (f32, f64) {
        let chunks = samples.chunks_exact(4);
        let (rest_peak, rest_sum) = mono_scalar(chunks.remainder());

        // SAFETY: NEON is mandatory on aarch64; each chunk holds 4 floats
        unsafe {
            let mut peak = vdupq_n_f32(0.0);
            let mut sum = vdupq_n_f64(0.0);
            for chunk in chunks {
                let v = vld1q_f32(chunk.as_ptr());
                peak = vmaxq_f32(peak, vabsq_f32(v));
                let lo = vcvt_f64_f32(vget_low_f32(v));
                let hi = vcvt_high_f64_f32(v);
                sum = vfmaq_f64(sum, lo, lo);
                sum = vfmaq_f64(sum, hi, hi);
            }
            (vmaxvq_f32(peak).max(rest_peak), vaddvq_f64(sum) + rest_sum)
        }
    }

    pub(super) fn stereo(samples: &[f32]) -> StereoSums {
        let chunks = samples.chunks_exact(4);
        let rest = stereo_scalar(chunks.remainder());

        // SAFETY: as above
        unsafe {
            let mut peak = vdupq_n_f32(0.0);
            let mut sum = vdupq_n_f64(0.0);
            for chunk in chunks {
                let v = vld1q_f32(chunk.as_ptr());
                peak = vmaxq_f32(peak, vabsq_f32(v));
                let lo = vcvt_f64_f32(vget_low_f32(v));
                let hi = vcvt_high_f64_f32(v);
                sum = vfmaq_f64(sum, lo, lo);
                sum = vfmaq_f64(sum, hi, hi);
            }

            let mut p = [0.0f32; 4];
            vst1q_f32(p.as_mut_ptr(), peak);
            StereoSums {
                peak_l: p[0].max(p[2]).max(rest.peak_l),
                peak_r: p[1].max(p[3]).max(rest.peak_r),
                sum_l: vgetq_lane_f64::<0>(sum) + rest.sum_l,
                sum_r: vgetq_lane_f64::<1>(sum) + rest.sum_r,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    fn test_signal(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 7919) % 1000) as f32 / 1000.0 * 1.6 - 0.8)
            .collect()
    }

    #[test]
    fn test_sine_rms() {
        let frames = 44100;
        let samples: Vec<f32> = (0..frames)
            .map(|i| (2.0 * PI * 1000.0 * i as f32 / 44100.0).sin())
            .collect();
        let reading = LevelMeter::new().levels(&samples, frames, 1);
        assert_relative_eq!(reading.rms, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-3);
        assert!(reading.peak > 0.999);
        assert!(reading.clipping);
    }

    #[test]
    fn test_simd_matches_scalar_mono() {
        let samples = test_signal(1027);
        let fast = LevelMeter::new().levels_mono(&samples);
        let slow = LevelMeter::scalar().levels_mono(&samples);
        assert_eq!(fast.peak, slow.peak);
        assert_relative_eq!(fast.rms, slow.rms, epsilon = 1e-6);
    }

    #[test]
    fn test_simd_matches_scalar_stereo() {
        let samples = test_signal(2 * 1021);
        let fast = LevelMeter::new().levels_stereo(&samples);
        let slow = LevelMeter::scalar().levels_stereo(&samples);
        assert_eq!(fast.peak_l, slow.peak_l);
        assert_eq!(fast.peak_r, slow.peak_r);
        assert_relative_eq!(fast.rms_l, slow.rms_l, epsilon = 1e-6);
        assert_relative_eq!(fast.rms_r, slow.rms_r, epsilon = 1e-6);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_sse2_kernels_match_scalar() {
        let samples = test_signal(515);
        let (peak, sum) = x86_impl::mono_sse2(&samples);
        let (speak, ssum) = mono_scalar(&samples);
        assert_eq!(peak, speak);
        assert_relative_eq!(sum, ssum, epsilon = 1e-9);

        let stereo = x86_impl::stereo_sse2(&samples[..514]);
        let expected = stereo_scalar(&samples[..514]);
        assert_eq!(stereo.peak_l, expected.peak_l);
        assert_eq!(stereo.peak_r, expected.peak_r);
        assert_relative_eq!(stereo.sum_l, expected.sum_l, epsilon = 1e-9);
    }

    #[test]
    fn test_stereo_sides_are_separated() {
        let samples: Vec<f32> = (0..64).flat_map(|_| [0.5, -0.25]).collect();
        let reading = LevelMeter::new().levels(&samples, 64, 2);
        assert_eq!(reading.peak_l, 0.5);
        assert_eq!(reading.peak_r, 0.25);
        assert_relative_eq!(reading.rms_l, 0.5, epsilon = 1e-6);
        assert_relative_eq!(reading.rms_r, 0.25, epsilon = 1e-6);
        assert!(!reading.clipping);
    }

    #[test]
    fn test_multichannel_uses_first_two_as_sides() {
        let frame = [0.1, 0.2, 0.9, 0.0, 0.0, 0.0];
        let samples: Vec<f32> = frame.iter().copied().cycle().take(6 * 10).collect();
        let reading = LevelMeter::new().levels(&samples, 10, 6);
        assert_eq!(reading.peak, 0.9);
        assert_eq!(reading.peak_l, 0.1);
        assert_eq!(reading.peak_r, 0.2);
    }

    #[test]
    fn test_clip_threshold() {
        let reading = LevelMeter::new().levels_mono(&[0.0, -0.99, 0.1]);
        assert!(reading.clipping);
        let reading = LevelMeter::new().levels_mono(&[0.0, 0.98]);
        assert!(!reading.clipping);
    }

    #[test]
    fn test_empty_is_silent() {
        assert_eq!(LevelMeter::new().levels(&[], 0, 2), LevelReading::default());
        assert_eq!(LevelMeter::new().levels(&[1.0; 8], 4, 0), LevelReading::default());
    }

    #[test]
    fn test_db_conversions() {
        assert_eq!(linear_to_db(0.0), DB_FLOOR);
        assert_relative_eq!(linear_to_db(1.0), 0.0);
        assert_relative_eq!(linear_to_db(0.5), -6.0206, epsilon = 1e-3);
        assert_relative_eq!(db_to_linear(-6.0206), 0.5, epsilon = 1e-4);
        assert_eq!(db_to_linear(-200.0), 0.0);
    }
}
