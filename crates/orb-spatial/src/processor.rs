//! Scene renderer
//!
//! `SpatialProcessor` holds everything shared by the scene (mode, layout,
//! listener, HRTF set). Each source owns a `SpatialTrack` with its filter
//! and delay state, created on the control thread and then driven from
//! the render thread without allocating.
//!
//! Per block and source:
//! 1. listener-relative direction and distance
//! 2. distance attenuation and directivity
//! 3. air absorption (optional)
//! 4. Doppler (optional)
//! 5. mode-specific rendering into the output layout
//! 6. crossfeed for stereo output (optional)

use orb_dsp::{FractionalDelay, OnePoleLowPass, Processor};
use serde::{Deserialize, Serialize};

use crate::air::AirAbsorption;
use crate::binaural::{BinauralVoice, Crossfeed};
use crate::doppler::{DOPPLER_NOMINAL_DELAY, DopplerShifter, doppler_factor};
use crate::error::{SpatialError, SpatialResult};
use crate::hrtf::HrtfDatabase;
use crate::position::{SpatialSource, Spherical};
use crate::scene::SpatialScene;
use crate::surround::{BassManager, MAX_CHANNELS, OutputLayout, Upmixer, VbapPanner};
use crate::SPEED_OF_SOUND;

/// Longest early-reflection delay, seconds
const MAX_REFLECTION_SECONDS: f64 = 0.1;

/// Reflection tap level relative to the reverb amount
const REFLECTION_LEVEL: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpatialMode {
    /// Constant-power stereo pan from azimuth
    #[default]
    Basic = 0,
    /// VBAP plus an early-reflection tap
    Spatial3d = 1,
    /// HRIR convolution with ITD/ILD
    BinauralHrtf = 2,
    /// VBAP over the speaker ring with bass management
    Surround = 3,
}

impl SpatialMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Spatial3d => "spatial_3d",
            Self::BinauralHrtf => "binaural_hrtf",
            Self::Surround => "surround",
        }
    }

    /// Relative per-source cost, percent of one core at 48 kHz
    fn base_cost(self) -> f32 {
        match self {
            Self::Basic => 0.05,
            Self::Spatial3d => 0.15,
            Self::Surround => 0.2,
            Self::BinauralHrtf => 0.5,
        }
    }
}

impl From<u8> for SpatialMode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Spatial3d,
            2 => Self::BinauralHrtf,
            3 => Self::Surround,
            _ => Self::Basic,
        }
    }
}

/// Per-source render state. Index 0 serves mono sources and the left
/// channel of stereo sources, index 1 the right channel.
#[derive(Debug, Clone)]
pub struct SpatialTrack {
    epoch: u64,
    primed: bool,
    gains: [f32; MAX_CHANNELS],
    direction: Spherical,
    air: [AirAbsorption; 2],
    doppler: [DopplerShifter; 2],
    binaural: BinauralVoice,
    crossfeed: Crossfeed,
    reflection: FractionalDelay,
    reflection_lp: OnePoleLowPass,
    bass: BassManager,
    upmixer: Upmixer,
}

impl SpatialTrack {
    fn new(sample_rate: f64, layout: OutputLayout, epoch: u64) -> Self {
        let reflection_len = (MAX_REFLECTION_SECONDS * sample_rate).ceil() as usize;
        Self {
            epoch,
            primed: false,
            gains: [0.0; MAX_CHANNELS],
            direction: Spherical::default(),
            air: [AirAbsorption::new(sample_rate), AirAbsorption::new(sample_rate)],
            doppler: [DopplerShifter::new(sample_rate), DopplerShifter::new(sample_rate)],
            binaural: BinauralVoice::new(sample_rate),
            crossfeed: Crossfeed::new(sample_rate),
            reflection: FractionalDelay::new(reflection_len),
            reflection_lp: OnePoleLowPass::new(4000.0, sample_rate),
            bass: BassManager::new(80.0, sample_rate),
            upmixer: Upmixer::new(layout, sample_rate),
        }
    }

    /// Direction and distance seen in the last processed block
    pub fn direction(&self) -> Spherical {
        self.direction
    }

    pub fn reset(&mut self) {
        self.primed = false;
        self.gains = [0.0; MAX_CHANNELS];
        for air in &mut self.air {
            air.reset();
        }
        for doppler in &mut self.doppler {
            doppler.reset();
        }
        self.binaural.reset();
        self.crossfeed.reset();
        self.reflection.reset();
        self.reflection_lp.reset();
        self.bass.reset();
        self.upmixer.reset();
    }

    /// Doppler then air absorption on one input lane
    #[inline]
    fn pre(&mut self, lane: usize, input: f32, doppler: bool, air: bool) -> f32 {
        let mut x = input;
        if doppler {
            x = self.doppler[lane].process(x);
        }
        if air {
            x = self.air[lane].process(x);
        }
        x
    }
}

/// Scene-level renderer
pub struct SpatialProcessor {
    sample_rate: f64,
    layout: OutputLayout,
    mode: SpatialMode,
    pending_mode: Option<SpatialMode>,
    scene: SpatialScene,
    hrtf: HrtfDatabase,
    panner: VbapPanner,
    epoch: u64,
}

impl SpatialProcessor {
    /// Uses the synthetic HRTF set until another is loaded
    pub fn new(sample_rate: f64, layout: OutputLayout) -> Self {
        Self {
            sample_rate,
            layout,
            mode: SpatialMode::Basic,
            pending_mode: None,
            scene: SpatialScene::default(),
            hrtf: HrtfDatabase::synthetic(sample_rate as u32),
            panner: VbapPanner::new(layout),
            epoch: 0,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn mode(&self) -> SpatialMode {
        self.mode
    }

    /// Takes effect at the next `begin_block`
    pub fn set_mode(&mut self, mode: SpatialMode) {
        if mode != self.mode || self.pending_mode.is_some() {
            self.pending_mode = Some(mode);
        }
    }

    pub fn pending_mode(&self) -> Option<SpatialMode> {
        self.pending_mode
    }

    /// Block boundary. Applies a pending mode change; every track resets
    /// on its next `process` call after a change.
    pub fn begin_block(&mut self) {
        if let Some(mode) = self.pending_mode.take()
            && mode != self.mode
        {
            self.mode = mode;
            self.epoch = self.epoch.wrapping_add(1);
        }
    }

    pub fn scene(&self) -> &SpatialScene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut SpatialScene {
        &mut self.scene
    }

    pub fn set_scene(&mut self, scene: SpatialScene) {
        self.scene = scene;
    }

    pub fn hrtf(&self) -> &HrtfDatabase {
        &self.hrtf
    }

    /// Replace the HRTF set. Tracks pick it up after their next reset.
    pub fn set_hrtf(&mut self, db: HrtfDatabase) -> SpatialResult<()> {
        if db.is_empty() {
            return Err(SpatialError::InvalidHrtf("database has no entries".into()));
        }
        if db.sample_rate() as f64 != self.sample_rate {
            log::warn!(
                "HRTF sample rate {} differs from engine rate {}",
                db.sample_rate(),
                self.sample_rate
            );
        }
        self.hrtf = db;
        self.epoch = self.epoch.wrapping_add(1);
        Ok(())
    }

    /// Allocate render state for a new source (control thread)
    pub fn create_track(&self) -> SpatialTrack {
        SpatialTrack::new(self.sample_rate, self.layout, self.epoch)
    }

    /// Estimated CPU cost of `sources` sources, percent of one core
    pub fn cpu_load_estimate(&self, sources: usize) -> f32 {
        let mut per_source = self.mode.base_cost();
        if self.mode == SpatialMode::BinauralHrtf {
            per_source += self.hrtf.ir_length() as f32 * 0.002;
        }
        if self.scene.flags.doppler {
            per_source += 0.05;
        }
        if self.scene.flags.air_absorption {
            per_source += 0.01;
        }
        per_source * (self.sample_rate as f32 / 48000.0) * sources as f32
    }

    /// Added output delay in samples for the current mode and flags.
    ///
    /// Counts the Doppler line's nominal delay and the HRIR length. The
    /// ITD line only delays the far ear, crossfeed and the reflection tap
    /// only delay added side paths, and the one-pole and biquad stages
    /// have no fixed delay, so none of them move the direct signal.
    pub fn latency_samples(&self) -> usize {
        let mut latency = 0;
        if self.scene.flags.doppler {
            latency += DOPPLER_NOMINAL_DELAY;
        }
        if self.mode == SpatialMode::BinauralHrtf {
            latency += self.hrtf.ir_length();
        }
        latency
    }

    /// Render `frames` of `input` (mono or interleaved stereo) and add the
    /// result into the interleaved `output` in this processor's layout.
    ///
    /// `gain` is the track volume; `pan` only affects `Basic` mode.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        track: &mut SpatialTrack,
        source: &SpatialSource,
        input: &[f32],
        in_channels: usize,
        frames: usize,
        gain: f32,
        pan: f32,
        output: &mut [f32],
    ) -> SpatialResult<()> {
        if in_channels != 1 && in_channels != 2 {
            return Err(SpatialError::InvalidChannelCount {
                expected: 2,
                got: in_channels,
            });
        }
        let channels = self.layout.channel_count();
        if input.len() < frames * in_channels {
            return Err(SpatialError::BufferSizeMismatch {
                expected: frames * in_channels,
                got: input.len(),
            });
        }
        if output.len() < frames * channels {
            return Err(SpatialError::BufferSizeMismatch {
                expected: frames * channels,
                got: output.len(),
            });
        }
        if frames == 0 {
            return Ok(());
        }

        if track.epoch != self.epoch {
            track.reset();
            track.epoch = self.epoch;
        }

        let scene = &self.scene;
        let listener = &scene.listener;
        let rel = listener.relative(source.position);
        track.direction = rel;

        let level = gain
            * scene.distance_gain(rel.distance)
            * source.directivity_gain(listener.position);

        let air_on = scene.flags.air_absorption;
        if air_on {
            for air in &mut track.air {
                air.update(rel.distance, scene.humidity);
            }
        }
        let doppler_on = scene.flags.doppler;
        if doppler_on {
            let factor = doppler_factor(
                listener.position,
                listener.velocity,
                source.position,
                source.velocity,
                SPEED_OF_SOUND,
            );
            for doppler in &mut track.doppler {
                doppler.set_factor(factor);
            }
        }

        let mode = match self.mode {
            SpatialMode::BinauralHrtf if !source.hrtf_required => SpatialMode::Spatial3d,
            mode => mode,
        };
        let stereo_in = in_channels == 2;
        let lfe = self.layout.lfe_index().filter(|_| scene.flags.bass_management);

        // Block-rate targets
        let mut target = [0.0f32; MAX_CHANNELS];
        match mode {
            SpatialMode::Basic => {
                if channels == 1 {
                    target[0] = level;
                } else {
                    let p = (pan + rel.azimuth_rad().sin()).clamp(-1.0, 1.0);
                    let (gl, gr) = pan_gains(p, stereo_in);
                    target[0] = gl * level;
                    target[1] = gr * level;
                }
            }
            SpatialMode::Spatial3d => {
                self.panner.gains(rel.azimuth, source.spread, &mut target);
                target.iter_mut().for_each(|g| *g *= level);
            }
            SpatialMode::Surround => {
                if stereo_in {
                    target[..channels].fill(level);
                } else {
                    self.panner.gains(rel.azimuth, source.spread, &mut target);
                    target.iter_mut().for_each(|g| *g *= level);
                    if let Some(lfe) = lfe {
                        track.bass.set_crossover(scene.crossover_hz);
                        track.bass.set_send(scene.lfe_send);
                        target[lfe] = level;
                    }
                }
            }
            SpatialMode::BinauralHrtf => {
                track.binaural.update(&self.hrtf, rel.azimuth, rel.elevation);
                target[..channels.min(2)].fill(level);
            }
        }

        if !track.primed {
            track.gains = target;
            track.primed = true;
        }
        let start = track.gains;
        let mut step = [0.0f32; MAX_CHANNELS];
        for ch in 0..channels {
            step[ch] = (target[ch] - start[ch]) / frames as f32;
        }

        let reflection_delay = (scene.room.first_reflection_path() / SPEED_OF_SOUND) as f64
            * self.sample_rate;
        let reflection_level = scene.reverb.amount.clamp(0.0, 1.0) * REFLECTION_LEVEL * level
            / (self.layout.speakers().len() as f32).sqrt();
        if mode == SpatialMode::Spatial3d {
            track
                .reflection_lp
                .set_cutoff(8000.0 / (1.0 + scene.reverb.decay.max(0.0) as f64));
        }
        let crossfeed_on = scene.flags.crossfeed
            && self.layout == OutputLayout::Stereo
            && mode != SpatialMode::Surround;
        if crossfeed_on {
            track.crossfeed.set_amount(scene.crossfeed_amount);
        }

        let speakers = self.layout.speakers();

        for (i, frame_out) in output.chunks_exact_mut(channels).take(frames).enumerate() {
            let (l, r) = if stereo_in {
                (input[i * 2], input[i * 2 + 1])
            } else {
                (input[i], input[i])
            };

            let mut g = [0.0f32; MAX_CHANNELS];
            let t = (i + 1) as f32;
            for ch in 0..channels {
                g[ch] = start[ch] + step[ch] * t;
            }

            let mut frame = [0.0f32; MAX_CHANNELS];
            match mode {
                SpatialMode::Basic => {
                    let l = track.pre(0, l, doppler_on, air_on);
                    let r = if stereo_in { track.pre(1, r, doppler_on, air_on) } else { l };
                    if channels == 1 {
                        frame[0] = (l + r) * 0.5 * g[0];
                    } else {
                        frame[0] = l * g[0];
                        frame[1] = r * g[1];
                    }
                }
                SpatialMode::Spatial3d => {
                    let m = track.pre(0, (l + r) * 0.5, doppler_on, air_on);
                    let tap = track.reflection.process(m, reflection_delay);
                    let reflected = track.reflection_lp.tick(tap as f64) as f32 * reflection_level;
                    for &(ch, _) in speakers {
                        frame[ch] = m * g[ch] + reflected;
                    }
                }
                SpatialMode::Surround if stereo_in => {
                    let l = track.pre(0, l, doppler_on, air_on);
                    let r = track.pre(1, r, doppler_on, air_on);
                    track.upmixer.process_frame(l, r, &mut frame[..channels]);
                    for ch in 0..channels {
                        frame[ch] *= g[ch];
                    }
                }
                SpatialMode::Surround => {
                    let m = track.pre(0, l, doppler_on, air_on);
                    match lfe {
                        Some(lfe) => {
                            let (high, low) = track.bass.split(m);
                            for &(ch, _) in speakers {
                                frame[ch] = high * g[ch];
                            }
                            frame[lfe] = low * g[lfe];
                        }
                        None => {
                            for &(ch, _) in speakers {
                                frame[ch] = m * g[ch];
                            }
                        }
                    }
                }
                SpatialMode::BinauralHrtf => {
                    let m = track.pre(0, (l + r) * 0.5, doppler_on, air_on);
                    let (bl, br) = track.binaural.process(m);
                    if channels == 1 {
                        frame[0] = (bl + br) * 0.5 * g[0];
                    } else {
                        frame[0] = bl * g[0];
                        frame[1] = br * g[1];
                    }
                }
            }

            if crossfeed_on {
                let (cl, cr) = track.crossfeed.process_frame(frame[0], frame[1]);
                frame[0] = cl;
                frame[1] = cr;
            }

            for (out, value) in frame_out.iter_mut().zip(frame.iter()) {
                *out += value;
            }
        }

        track.gains = target;
        Ok(())
    }
}

/// Left/right gains for a pan position in -1..=1.
///
/// Mono sources use the constant-power law. Stereo sources use it scaled
/// by sqrt(2) and capped at unity: the centre passes both channels
/// untouched and a hard pan mutes the opposite side.
pub fn pan_gains(pan: f32, stereo_source: bool) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
    let (l, r) = (angle.cos(), angle.sin());
    if !stereo_source {
        return (l, r);
    }
    let boost = std::f32::consts::SQRT_2;
    if pan > 0.0 {
        ((l * boost).clamp(0.0, 1.0), 1.0)
    } else if pan < 0.0 {
        (1.0, (r * boost).clamp(0.0, 1.0))
    } else {
        (1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Vec3;

    const SR: f64 = 48000.0;

    fn sine(freq: f64, frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|n| (2.0 * std::f64::consts::PI * freq * n as f64 / SR).sin() as f32)
            .collect()
    }

    fn channel_rms(buffer: &[f32], channels: usize, ch: usize, skip: usize) -> f32 {
        let samples: Vec<f32> = buffer.iter().skip(ch).step_by(channels).skip(skip).copied().collect();
        (samples.iter().map(|x| x * x).sum::<f32>() / samples.len().max(1) as f32).sqrt()
    }

    /// Render a mono source in blocks of 256
    fn render_mono(proc: &mut SpatialProcessor, source: &SpatialSource, input: &[f32]) -> Vec<f32> {
        let channels = proc.layout().channel_count();
        let mut track = proc.create_track();
        let mut out = vec![0.0; input.len() * channels];
        for (block_in, block_out) in input.chunks(256).zip(out.chunks_mut(256 * channels)) {
            proc.begin_block();
            proc.process(&mut track, source, block_in, 1, block_in.len(), 1.0, 0.0, block_out)
                .unwrap();
        }
        out
    }

    #[test]
    fn test_mode_roundtrip_u8() {
        for mode in [
            SpatialMode::Basic,
            SpatialMode::Spatial3d,
            SpatialMode::BinauralHrtf,
            SpatialMode::Surround,
        ] {
            assert_eq!(SpatialMode::from(mode as u8), mode);
        }
        assert_eq!(SpatialMode::from(200), SpatialMode::Basic);
    }

    #[test]
    fn test_pan_gains() {
        let (l, r) = pan_gains(0.0, false);
        assert!((l - r).abs() < 1e-6);
        assert!((l * l + r * r - 1.0).abs() < 1e-6);

        assert_eq!(pan_gains(0.0, true), (1.0, 1.0));
        let (l, r) = pan_gains(1.0, true);
        assert!(l.abs() < 1e-6);
        assert_eq!(r, 1.0);
    }

    #[test]
    fn test_basic_center_pan_is_equal() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let source = SpatialSource::default();
        let out = render_mono(&mut proc, &source, &sine(440.0, 4800));
        for frame in out.chunks_exact(2) {
            assert!((frame[0] - frame[1]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_basic_stereo_unity_at_center() {
        let proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let mut track = proc.create_track();
        let input: Vec<f32> = sine(1000.0, 1024).iter().flat_map(|&s| [s, s]).collect();
        let mut out = vec![0.0; 2048];
        proc.process(&mut track, &SpatialSource::default(), &input, 2, 1024, 1.0, 0.0, &mut out)
            .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_distance_attenuation_in_processor() {
        let input = vec![0.5f32; 512];
        for (z, expected) in [(0.5f32, 1.0f32), (1.0, 1.0), (4.0, 0.25)] {
            let mut proc = SpatialProcessor::new(SR, OutputLayout::Mono);
            proc.scene_mut().flags.air_absorption = false;
            let out = render_mono(&mut proc, &SpatialSource::at(Vec3::new(0.0, 0.0, z)), &input);
            assert!((out[511] - 0.5 * expected).abs() < 1e-5, "z={}", z);
        }
    }

    #[test]
    fn test_spatial3d_right_source_favors_right() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.set_mode(SpatialMode::Spatial3d);
        let input = sine(1000.0, 48000);

        let out = render_mono(&mut proc, &SpatialSource::at(Vec3::new(1.0, 0.0, 0.0)), &input);
        let l = channel_rms(&out, 2, 0, 4800);
        let r = channel_rms(&out, 2, 1, 4800);
        assert!(20.0 * (r / l).log10() >= 6.0, "L={} R={}", l, r);

        let out = render_mono(&mut proc, &SpatialSource::at(Vec3::new(0.0, 0.0, 1.0)), &input);
        let l = channel_rms(&out, 2, 0, 4800);
        let r = channel_rms(&out, 2, 1, 4800);
        assert!((l - r).abs() <= 0.01 * l.max(r));
    }

    #[test]
    fn test_mode_change_waits_for_block_boundary() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.set_mode(SpatialMode::BinauralHrtf);
        assert_eq!(proc.mode(), SpatialMode::Basic);
        assert_eq!(proc.pending_mode(), Some(SpatialMode::BinauralHrtf));

        proc.begin_block();
        assert_eq!(proc.mode(), SpatialMode::BinauralHrtf);
        assert_eq!(proc.pending_mode(), None);
    }

    #[test]
    fn test_mode_change_resets_tracks() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.set_mode(SpatialMode::Spatial3d);
        proc.begin_block();
        let mut track = proc.create_track();
        let source = SpatialSource::at(Vec3::new(0.0, 0.0, 2.0));
        let input = vec![1.0f32; 256];
        let mut out = vec![0.0; 512];
        proc.process(&mut track, &source, &input, 1, 256, 1.0, 0.0, &mut out).unwrap();

        proc.set_mode(SpatialMode::Basic);
        proc.begin_block();
        // A reset track starts from its target gain, no ramp from the old mode
        let silence = vec![0.0f32; 256];
        let mut out = vec![0.0; 512];
        proc.process(&mut track, &source, &silence, 1, 256, 1.0, 0.0, &mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_binaural_right_source() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.set_mode(SpatialMode::BinauralHrtf);
        let out = render_mono(&mut proc, &SpatialSource::at(Vec3::new(2.0, 0.0, 0.0)), &sine(1000.0, 9600));
        let l = channel_rms(&out, 2, 0, 2400);
        let r = channel_rms(&out, 2, 1, 2400);
        assert!(r > l * 2.0);
    }

    #[test]
    fn test_binaural_without_hrtf_falls_back_to_panning() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.set_mode(SpatialMode::BinauralHrtf);
        let mut source = SpatialSource::at(Vec3::new(1.0, 0.0, 0.0));
        source.hrtf_required = false;
        let out = render_mono(&mut proc, &source, &sine(1000.0, 4800));
        // Stereo VBAP clamps a hard-right source to the right speaker
        let l = channel_rms(&out, 2, 0, 1200);
        let r = channel_rms(&out, 2, 1, 1200);
        assert!(r > l * 4.0);
    }

    #[test]
    fn test_surround_bass_management_feeds_lfe() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Surround51);
        proc.set_mode(SpatialMode::Surround);
        let source = SpatialSource::at(Vec3::new(0.0, 0.0, 1.0));

        let out = render_mono(&mut proc, &source, &sine(40.0, 48000));
        let lfe = channel_rms(&out, 6, 3, 24000);
        let center = channel_rms(&out, 6, 2, 24000);
        assert!(lfe > center * 2.0);

        let out = render_mono(&mut proc, &source, &sine(2000.0, 48000));
        let lfe = channel_rms(&out, 6, 3, 24000);
        let center = channel_rms(&out, 6, 2, 24000);
        assert!(center > lfe * 50.0);
    }

    #[test]
    fn test_surround_stereo_source_is_upmixed() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Surround51);
        proc.set_mode(SpatialMode::Surround);
        proc.begin_block();
        let mut track = proc.create_track();
        let input: Vec<f32> = sine(1000.0, 1024).iter().flat_map(|&s| [s, 0.0]).collect();
        let mut out = vec![0.0; 1024 * 6];
        proc.process(&mut track, &SpatialSource::default(), &input, 2, 1024, 1.0, 0.0, &mut out)
            .unwrap();
        assert!(channel_rms(&out, 6, 0, 256) > 0.5);
        assert!(channel_rms(&out, 6, 2, 256) > 0.1);
        assert!(channel_rms(&out, 6, 4, 256) > 0.1);
    }

    #[test]
    fn test_process_accumulates() {
        let proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let mut a = proc.create_track();
        let mut b = proc.create_track();
        let input = vec![0.25f32; 64];
        let mut out = vec![0.0; 128];
        let source = SpatialSource::default();
        proc.process(&mut a, &source, &input, 1, 64, 1.0, 0.0, &mut out).unwrap();
        proc.process(&mut b, &source, &input, 1, 64, 1.0, 0.0, &mut out).unwrap();
        let expected = 2.0 * 0.25 * std::f32::consts::FRAC_1_SQRT_2;
        assert!((out[127] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let mut track = proc.create_track();
        let source = SpatialSource::default();
        let mut out = vec![0.0; 64];
        assert!(matches!(
            proc.process(&mut track, &source, &[0.0; 96], 3, 32, 1.0, 0.0, &mut out),
            Err(SpatialError::InvalidChannelCount { .. })
        ));
        assert!(matches!(
            proc.process(&mut track, &source, &[0.0; 8], 1, 32, 1.0, 0.0, &mut out),
            Err(SpatialError::BufferSizeMismatch { .. })
        ));
        assert!(proc.process(&mut track, &source, &[], 1, 0, 1.0, 0.0, &mut out).is_ok());
    }

    #[test]
    fn test_cpu_estimate_ordering() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let mut loads = Vec::new();
        for mode in [SpatialMode::Basic, SpatialMode::Spatial3d, SpatialMode::BinauralHrtf] {
            proc.set_mode(mode);
            proc.begin_block();
            loads.push(proc.cpu_load_estimate(8));
        }
        assert!(loads[0] < loads[1]);
        assert!(loads[1] < loads[2]);
        assert_eq!(proc.cpu_load_estimate(0), 0.0);
    }

    #[test]
    fn test_latency_reporting() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        assert_eq!(proc.latency_samples(), 0);

        proc.scene_mut().flags.doppler = true;
        assert_eq!(proc.latency_samples(), DOPPLER_NOMINAL_DELAY);

        proc.set_mode(SpatialMode::BinauralHrtf);
        proc.begin_block();
        assert_eq!(
            proc.latency_samples(),
            DOPPLER_NOMINAL_DELAY + proc.hrtf().ir_length()
        );
    }

    #[test]
    fn test_set_hrtf_rejects_empty() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        let empty = HrtfDatabase::new(48000, 32, false).unwrap();
        assert!(proc.set_hrtf(empty).is_err());
        assert!(proc.set_hrtf(HrtfDatabase::synthetic(48000)).is_ok());
    }

    #[test]
    fn test_side_paths_add_no_latency() {
        let mut proc = SpatialProcessor::new(SR, OutputLayout::Stereo);
        proc.scene_mut().flags.crossfeed = true;
        proc.scene_mut().flags.air_absorption = true;
        proc.set_mode(SpatialMode::Spatial3d);
        proc.begin_block();
        assert_eq!(proc.latency_samples(), 0);

        // Direct path of the crossfeed is undelayed
        let mut crossfeed = Crossfeed::new(SR);
        crossfeed.set_amount(0.5);
        let (l, r) = crossfeed.process_frame(1.0, 0.0);
        assert!(l > 0.5);
        assert_eq!(r, 0.0);
    }
}
