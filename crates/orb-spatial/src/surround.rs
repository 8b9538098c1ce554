//! Speaker layouts, VBAP panning, up/down-mixing and bass management
//!
//! Channel orders:
//! - Stereo: L R
//! - 5.1: L R C LFE Ls Rs
//! - 7.1: L R C LFE Lss Rss Lrs Rrs

use orb_dsp::{BiquadFilter, FilterMode, FirstOrderAllpass, MonoProcessor, Processor};
use serde::{Deserialize, Serialize};

use crate::error::{SpatialError, SpatialResult};

/// Widest supported layout
pub const MAX_CHANNELS: usize = 8;

/// -3 dB
const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Keeps a correlated stereo signal at unity through up-mix then down-mix
pub const DOWNMIX_NORMALIZATION: f32 = 2.0 / 3.0;

/// Butterworth Q (0.707) expressed as bandwidth in octaves
const BUTTERWORTH_BANDWIDTH: f64 = 1.9;

/// Slack when matching a direction to a speaker pair, radians
const ANGLE_EPSILON: f32 = 1e-5;

/// LFE low-pass corner for up-mixing
const UPMIX_LFE_HZ: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputLayout {
    Mono,
    #[default]
    Stereo,
    Surround51,
    Surround71,
}

impl OutputLayout {
    /// Layout for an output channel count
    pub fn from_channels(channels: usize) -> SpatialResult<Self> {
        match channels {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            6 => Ok(Self::Surround51),
            8 => Ok(Self::Surround71),
            n => Err(SpatialError::UnsupportedLayout(n)),
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Surround51 => 6,
            Self::Surround71 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mono => "mono",
            Self::Stereo => "stereo",
            Self::Surround51 => "5.1",
            Self::Surround71 => "7.1",
        }
    }

    pub fn lfe_index(self) -> Option<usize> {
        match self {
            Self::Surround51 | Self::Surround71 => Some(3),
            _ => None,
        }
    }

    pub fn is_surround(self) -> bool {
        self.lfe_index().is_some()
    }

    /// Full-range speakers as (channel, azimuth degrees)
    pub fn speakers(self) -> &'static [(usize, f32)] {
        match self {
            Self::Mono => &[(0, 0.0)],
            Self::Stereo => &[(0, -30.0), (1, 30.0)],
            Self::Surround51 => &[(0, -30.0), (1, 30.0), (2, 0.0), (4, -110.0), (5, 110.0)],
            Self::Surround71 => &[
                (0, -30.0),
                (1, 30.0),
                (2, 0.0),
                (4, -90.0),
                (5, 90.0),
                (6, -150.0),
                (7, 150.0),
            ],
        }
    }

    /// Whether the speakers surround the listener (pairs wrap through 180)
    pub fn is_closed_ring(self) -> bool {
        self.is_surround()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VBAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Pairwise 2D VBAP over the layout's horizontal ring.
///
/// Speakers are sorted by azimuth once. Sources outside an open arc
/// (stereo) clamp to the nearest speaker.
#[derive(Debug, Clone)]
pub struct VbapPanner {
    layout: OutputLayout,
    /// (channel, azimuth radians) sorted by azimuth
    ring: Vec<(usize, f32)>,
}

impl VbapPanner {
    pub fn new(layout: OutputLayout) -> Self {
        let mut ring: Vec<(usize, f32)> = layout
            .speakers()
            .iter()
            .map(|&(ch, az)| (ch, az.to_radians()))
            .collect();
        ring.sort_by(|a, b| a.1.total_cmp(&b.1));
        Self { layout, ring }
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Per-channel gains for a source direction. Unused channels are zero.
    /// `spread` blends toward equal power on every full-range speaker.
    pub fn gains(&self, azimuth_deg: f32, spread: f32, out: &mut [f32; MAX_CHANNELS]) {
        out.fill(0.0);
        if self.ring.len() == 1 {
            out[self.ring[0].0] = 1.0;
            return;
        }

        let az = wrap_radians(azimuth_deg.to_radians());
        let (first, last) = (self.ring[0], self.ring[self.ring.len() - 1]);

        if !self.layout.is_closed_ring() {
            if az <= first.1 {
                out[first.0] = 1.0;
            } else if az >= last.1 {
                out[last.0] = 1.0;
            } else {
                self.pair_gains(az, out);
            }
        } else {
            self.pair_gains(az, out);
        }

        let spread = spread.clamp(0.0, 1.0);
        if spread > 0.0 {
            let equal = 1.0 / (self.ring.len() as f32).sqrt();
            let mut power = 0.0;
            for &(ch, _) in &self.ring {
                out[ch] = out[ch] * (1.0 - spread) + equal * spread;
                power += out[ch] * out[ch];
            }
            if power > 1e-12 {
                let scale = 1.0 / power.sqrt();
                for &(ch, _) in &self.ring {
                    out[ch] *= scale;
                }
            }
        }
    }

    fn pair_gains(&self, az: f32, out: &mut [f32; MAX_CHANNELS]) {
        let n = self.ring.len();
        for i in 0..n {
            let (ch1, a1) = self.ring[i];
            let (ch2, mut a2) = self.ring[(i + 1) % n];
            let mut target = az;
            if i + 1 == n {
                // Pair through the rear
                a2 += std::f32::consts::TAU;
                if target < a1 {
                    target += std::f32::consts::TAU;
                }
            }
            if target >= a1 - ANGLE_EPSILON && target <= a2 + ANGLE_EPSILON {
                let (g1, g2) = vbap_pair(target, a1, a2);
                out[ch1] = g1;
                out[ch2] = g2;
                return;
            }
        }
    }
}

/// Solve `p = g1 * l1 + g2 * l2` in the horizontal plane (x = sin, z = cos)
/// and normalize to constant power
fn vbap_pair(az: f32, a1: f32, a2: f32) -> (f32, f32) {
    let (px, pz) = (az.sin(), az.cos());
    let det = (a1 - a2).sin();
    if det.abs() < 1e-6 {
        return (MINUS_3DB, MINUS_3DB);
    }
    let g1 = ((px * a2.cos() - pz * a2.sin()) / det).max(0.0);
    let g2 = ((pz * a1.sin() - px * a1.cos()) / det).max(0.0);
    let norm = (g1 * g1 + g2 * g2).sqrt();
    if norm < 1e-9 { (MINUS_3DB, MINUS_3DB) } else { (g1 / norm, g2 / norm) }
}

fn wrap_radians(a: f32) -> f32 {
    (a + std::f32::consts::PI).rem_euclid(std::f32::consts::TAU) - std::f32::consts::PI
}

// ═══════════════════════════════════════════════════════════════════════════════
// UP/DOWN-MIX
// ═══════════════════════════════════════════════════════════════════════════════

/// Stereo to layout up-mixer.
///
/// Center gets the -3 dB sum, LFE the low-passed sum, surrounds the
/// allpass-decorrelated difference.
#[derive(Debug, Clone)]
pub struct Upmixer {
    layout: OutputLayout,
    lfe: BiquadFilter,
    side_left: FirstOrderAllpass,
    side_right: FirstOrderAllpass,
    rear_left: FirstOrderAllpass,
    rear_right: FirstOrderAllpass,
}

impl Upmixer {
    pub fn new(layout: OutputLayout, sample_rate: f64) -> Self {
        Self {
            layout,
            lfe: BiquadFilter::with_params(
                FilterMode::LowPass,
                sample_rate,
                UPMIX_LFE_HZ,
                BUTTERWORTH_BANDWIDTH,
                0.0,
            ),
            side_left: FirstOrderAllpass::new(700.0, sample_rate),
            side_right: FirstOrderAllpass::new(1100.0, sample_rate),
            rear_left: FirstOrderAllpass::new(1700.0, sample_rate),
            rear_right: FirstOrderAllpass::new(2500.0, sample_rate),
        }
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// One stereo frame into `out[..layout.channel_count()]`
    #[inline]
    pub fn process_frame(&mut self, left: f32, right: f32, out: &mut [f32]) {
        let sum = (left + right) * 0.5;
        match self.layout {
            OutputLayout::Mono => out[0] = sum,
            OutputLayout::Stereo => {
                out[0] = left;
                out[1] = right;
            }
            OutputLayout::Surround51 => {
                let diff = (left - right) * 0.5;
                out[0] = left;
                out[1] = right;
                out[2] = sum * MINUS_3DB;
                out[3] = self.lfe.process_sample(sum);
                out[4] = self.side_left.tick(diff as f64) as f32;
                out[5] = self.side_right.tick(-diff as f64) as f32;
            }
            OutputLayout::Surround71 => {
                let diff = (left - right) * 0.5 * MINUS_3DB;
                out[0] = left;
                out[1] = right;
                out[2] = sum * MINUS_3DB;
                out[3] = self.lfe.process_sample(sum);
                out[4] = self.side_left.tick(diff as f64) as f32;
                out[5] = self.side_right.tick(-diff as f64) as f32;
                out[6] = self.rear_left.tick(diff as f64) as f32;
                out[7] = self.rear_right.tick(-diff as f64) as f32;
            }
        }
    }

    /// Interleaved stereo in, interleaved layout out
    pub fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) -> SpatialResult<()> {
        let channels = self.layout.channel_count();
        check_len(input.len(), frames * 2)?;
        check_len(output.len(), frames * channels)?;
        for (frame_in, frame_out) in input.chunks_exact(2).zip(output.chunks_exact_mut(channels)) {
            self.process_frame(frame_in[0], frame_in[1], frame_out);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.lfe.reset();
        self.side_left.reset();
        self.side_right.reset();
        self.rear_left.reset();
        self.rear_right.reset();
    }
}

/// ITU-style fold-down of one frame to stereo.
/// `L' = (L + 0.707 C + 0.707 LFE + 0.707 Ls) * 2/3`
#[inline]
pub fn downmix_frame(layout: OutputLayout, frame: &[f32]) -> (f32, f32) {
    match layout {
        OutputLayout::Mono => (frame[0], frame[0]),
        OutputLayout::Stereo => (frame[0], frame[1]),
        OutputLayout::Surround51 => {
            let shared = MINUS_3DB * (frame[2] + frame[3]);
            (
                (frame[0] + shared + MINUS_3DB * frame[4]) * DOWNMIX_NORMALIZATION,
                (frame[1] + shared + MINUS_3DB * frame[5]) * DOWNMIX_NORMALIZATION,
            )
        }
        OutputLayout::Surround71 => {
            let shared = MINUS_3DB * (frame[2] + frame[3]);
            (
                (frame[0] + shared + MINUS_3DB * (frame[4] + frame[6])) * DOWNMIX_NORMALIZATION,
                (frame[1] + shared + MINUS_3DB * (frame[5] + frame[7])) * DOWNMIX_NORMALIZATION,
            )
        }
    }
}

/// Interleaved layout in, interleaved stereo out
pub fn downmix_to_stereo(
    layout: OutputLayout,
    input: &[f32],
    output: &mut [f32],
    frames: usize,
) -> SpatialResult<()> {
    let channels = layout.channel_count();
    check_len(input.len(), frames * channels)?;
    check_len(output.len(), frames * 2)?;
    for (frame_in, frame_out) in input.chunks_exact(channels).zip(output.chunks_exact_mut(2)) {
        let (l, r) = downmix_frame(layout, frame_in);
        frame_out[0] = l;
        frame_out[1] = r;
    }
    Ok(())
}

fn check_len(got: usize, expected: usize) -> SpatialResult<()> {
    if got < expected {
        Err(SpatialError::BufferSizeMismatch { expected, got })
    } else {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASS MANAGEMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Complementary Butterworth split at the crossover. The high band feeds
/// the full-range speakers, the low band the LFE channel.
#[derive(Debug, Clone)]
pub struct BassManager {
    high: BiquadFilter,
    low: BiquadFilter,
    send: f32,
}

impl BassManager {
    pub fn new(crossover_hz: f32, sample_rate: f64) -> Self {
        let crossover = crossover_hz as f64;
        Self {
            high: BiquadFilter::with_params(FilterMode::HighPass, sample_rate, crossover, BUTTERWORTH_BANDWIDTH, 0.0),
            low: BiquadFilter::with_params(FilterMode::LowPass, sample_rate, crossover, BUTTERWORTH_BANDWIDTH, 0.0),
            send: 1.0,
        }
    }

    pub fn set_crossover(&mut self, crossover_hz: f32) {
        self.high.set_frequency(crossover_hz as f64);
        self.low.set_frequency(crossover_hz as f64);
    }

    pub fn crossover(&self) -> f32 {
        self.high.frequency() as f32
    }

    /// Level of the low band at the LFE channel
    pub fn set_send(&mut self, send: f32) {
        self.send = send.clamp(0.0, 4.0);
    }

    /// (high band, scaled low band)
    #[inline]
    pub fn split(&mut self, input: f32) -> (f32, f32) {
        let high = self.high.process_sample(input);
        let low = self.low.process_sample(input) * self.send;
        (high, low)
    }

    pub fn reset(&mut self) {
        self.high.reset();
        self.low.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: impl Iterator<Item = f32>) -> f32 {
        let (sum, n) = samples.fold((0.0f64, 0usize), |(s, n), x| (s + (x * x) as f64, n + 1));
        (sum / n.max(1) as f64).sqrt() as f32
    }

    #[test]
    fn test_layout_from_channels() {
        assert_eq!(OutputLayout::from_channels(1).unwrap(), OutputLayout::Mono);
        assert_eq!(OutputLayout::from_channels(2).unwrap(), OutputLayout::Stereo);
        assert_eq!(OutputLayout::from_channels(6).unwrap(), OutputLayout::Surround51);
        assert_eq!(OutputLayout::from_channels(8).unwrap(), OutputLayout::Surround71);
        assert!(matches!(
            OutputLayout::from_channels(4),
            Err(SpatialError::UnsupportedLayout(4))
        ));
        assert_eq!(OutputLayout::Surround71.channel_count(), 8);
        assert_eq!(OutputLayout::Stereo.lfe_index(), None);
    }

    #[test]
    fn test_vbap_stereo_center() {
        let panner = VbapPanner::new(OutputLayout::Stereo);
        let mut g = [0.0; MAX_CHANNELS];
        panner.gains(0.0, 0.0, &mut g);
        assert!((g[0] - MINUS_3DB).abs() < 1e-5);
        assert!((g[1] - MINUS_3DB).abs() < 1e-5);
    }

    #[test]
    fn test_vbap_stereo_clamps_outside_arc() {
        let panner = VbapPanner::new(OutputLayout::Stereo);
        let mut g = [0.0; MAX_CHANNELS];

        panner.gains(90.0, 0.0, &mut g);
        assert_eq!((g[0], g[1]), (0.0, 1.0));

        panner.gains(-120.0, 0.0, &mut g);
        assert_eq!((g[0], g[1]), (1.0, 0.0));

        panner.gains(30.0, 0.0, &mut g);
        assert!(g[0].abs() < 1e-5);
        assert!((g[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vbap_constant_power() {
        for layout in [OutputLayout::Stereo, OutputLayout::Surround51, OutputLayout::Surround71] {
            let panner = VbapPanner::new(layout);
            let mut g = [0.0; MAX_CHANNELS];
            for step in 0..72 {
                let az = -180.0 + step as f32 * 5.0;
                panner.gains(az, 0.0, &mut g);
                let power: f32 = g.iter().map(|x| x * x).sum();
                assert!((power - 1.0).abs() < 1e-4, "{} at {}: {}", layout.name(), az, power);
            }
        }
    }

    #[test]
    fn test_vbap_surround_front_and_rear() {
        let panner = VbapPanner::new(OutputLayout::Surround51);
        let mut g = [0.0; MAX_CHANNELS];

        panner.gains(0.0, 0.0, &mut g);
        assert!((g[2] - 1.0).abs() < 1e-5);
        assert_eq!(g[3], 0.0, "LFE is never panned");

        // Directly behind sits between Ls and Rs
        panner.gains(180.0, 0.0, &mut g);
        assert!((g[4] - g[5]).abs() < 1e-4);
        assert!(g[4] > 0.5);
        assert!(g[0] < 1e-5 && g[1] < 1e-5);

        panner.gains(-110.0, 0.0, &mut g);
        assert!((g[4] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_vbap_spread_reaches_all_speakers() {
        let panner = VbapPanner::new(OutputLayout::Surround71);
        let mut g = [0.0; MAX_CHANNELS];
        panner.gains(0.0, 1.0, &mut g);
        for &(ch, _) in OutputLayout::Surround71.speakers() {
            assert!((g[ch] - 1.0 / 7.0f32.sqrt()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_upmix_downmix_roundtrip_within_1db() {
        let sr = 48000.0;
        for layout in [OutputLayout::Surround51, OutputLayout::Surround71] {
            let mut up = Upmixer::new(layout, sr);
            let frames = 9600;
            let stereo: Vec<f32> = (0..frames)
                .flat_map(|n| {
                    let s = 0.5 * (2.0 * std::f64::consts::PI * 1000.0 * n as f64 / sr).sin() as f32;
                    [s, s]
                })
                .collect();

            let mut multi = vec![0.0; frames * layout.channel_count()];
            up.process(&stereo, &mut multi, frames).unwrap();
            let mut back = vec![0.0; frames * 2];
            downmix_to_stereo(layout, &multi, &mut back, frames).unwrap();

            let skip = 2400;
            for ch in 0..2 {
                let before = rms(stereo.iter().skip(skip * 2 + ch).step_by(2).copied());
                let after = rms(back.iter().skip(skip * 2 + ch).step_by(2).copied());
                let diff_db = 20.0 * (after / before).log10();
                assert!(diff_db.abs() <= 1.0, "{} ch{}: {} dB", layout.name(), ch, diff_db);
            }
        }
    }

    #[test]
    fn test_upmix_rears_carry_difference_only() {
        let mut up = Upmixer::new(OutputLayout::Surround51, 48000.0);
        let mut frame = [0.0; 6];
        for _ in 0..100 {
            up.process_frame(0.3, 0.3, &mut frame);
        }
        assert_eq!(frame[4], 0.0);
        assert_eq!(frame[5], 0.0);
        assert!((frame[2] - 0.3 * MINUS_3DB).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_buffer_too_small() {
        let input = vec![0.0; 12];
        let mut output = vec![0.0; 2];
        assert!(downmix_to_stereo(OutputLayout::Surround51, &input, &mut output, 2).is_err());
    }

    #[test]
    fn test_bass_manager_split() {
        let sr = 48000.0;
        let mut bass = BassManager::new(80.0, sr);

        let measure = |bass: &mut BassManager, freq: f64| {
            bass.reset();
            let mut high = Vec::new();
            let mut low = Vec::new();
            for n in 0..48000 {
                let x = (2.0 * std::f64::consts::PI * freq * n as f64 / sr).sin() as f32;
                let (h, l) = bass.split(x);
                if n > 24000 {
                    high.push(h);
                    low.push(l);
                }
            }
            (rms(high.into_iter()), rms(low.into_iter()))
        };

        let (high, low) = measure(&mut bass, 30.0);
        assert!(low > high * 4.0);

        let (high, low) = measure(&mut bass, 1000.0);
        assert!(high > low * 100.0);
    }
}
