//! Tracks
//!
//! `TrackParams` is the lock-free half of a track: every field a control
//! thread may change while the audio thread runs. `Track` is the render
//! half, owned by the mixer graph and touched only under its lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

use orb_core::Sample;
use orb_dsp::{BiquadFilter, FilterMode, MonoProcessor, Processor};
use orb_spatial::{SpatialSource, SpatialTrack, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::meter::{AtomicF32, MeterData};
use crate::streamer::FileStreamer;

/// Seqlock read retries per block before deferring to the next block
const FILTER_READ_ATTEMPTS: usize = 4;

/// Stable track identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-track EQ band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub mode: FilterMode,
    pub frequency: f64,
    /// Octaves
    pub bandwidth: f64,
    pub gain_db: f64,
    pub enabled: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            mode: FilterMode::Peaking,
            frequency: 1000.0,
            bandwidth: 1.0,
            gain_db: 0.0,
            enabled: false,
        }
    }
}

#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACK PARAMS (lock-free)
// ═══════════════════════════════════════════════════════════════════════════

/// Parameters shared between control threads and the audio thread
#[derive(Debug)]
pub struct TrackParams {
    volume: AtomicF32,
    pan: AtomicF32,
    mute: AtomicBool,
    solo: AtomicBool,
    position: [AtomicF32; 3],
    velocity: [AtomicF32; 3],
    filter_mode: AtomicU8,
    filter_frequency: AtomicF64,
    filter_bandwidth: AtomicF64,
    filter_gain_db: AtomicF64,
    filter_enabled: AtomicBool,
    /// Sequence counter over the filter fields: odd while a write is in
    /// progress, advanced by two per completed write
    filter_seq: AtomicU32,
    /// Serializes filter writers
    filter_write: Mutex<()>,
    pub meter: MeterData,
}

impl TrackParams {
    pub fn new() -> Self {
        let filter = FilterSettings::default();
        let params = Self {
            volume: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            mute: AtomicBool::new(false),
            solo: AtomicBool::new(false),
            position: Default::default(),
            velocity: Default::default(),
            filter_mode: AtomicU8::new(filter.mode as u8),
            filter_frequency: AtomicF64::default(),
            filter_bandwidth: AtomicF64::default(),
            filter_gain_db: AtomicF64::default(),
            filter_enabled: AtomicBool::new(false),
            filter_seq: AtomicU32::new(0),
            filter_write: Mutex::new(()),
            meter: MeterData::new(),
        };
        params.set_filter(filter);
        params
    }

    #[inline]
    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    /// Clamped to 0..=1
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0));
    }

    #[inline]
    pub fn pan(&self) -> f32 {
        self.pan.load()
    }

    /// Clamped to -1..=1
    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan.clamp(-1.0, 1.0));
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Release);
    }

    #[inline]
    pub fn is_soloed(&self) -> bool {
        self.solo.load(Ordering::Relaxed)
    }

    pub fn set_solo(&self, solo: bool) {
        self.solo.store(solo, Ordering::Release);
    }

    pub fn position(&self) -> Vec3 {
        let [x, y, z] = &self.position;
        Vec3::new(x.load(), y.load(), z.load())
    }

    pub fn set_position(&self, position: Vec3) {
        let [x, y, z] = &self.position;
        x.store(position.x);
        y.store(position.y);
        z.store(position.z);
    }

    pub fn velocity(&self) -> Vec3 {
        let [x, y, z] = &self.velocity;
        Vec3::new(x.load(), y.load(), z.load())
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        let [x, y, z] = &self.velocity;
        x.store(velocity.x);
        y.store(velocity.y);
        z.store(velocity.z);
    }

    fn load_filter_fields(&self) -> FilterSettings {
        FilterSettings {
            mode: FilterMode::from(self.filter_mode.load(Ordering::Relaxed)),
            frequency: self.filter_frequency.load(),
            bandwidth: self.filter_bandwidth.load(),
            gain_db: self.filter_gain_db.load(),
            enabled: self.filter_enabled.load(Ordering::Relaxed),
        }
    }

    /// Current filter settings (control thread)
    pub fn filter(&self) -> FilterSettings {
        let _guard = self.filter_write.lock();
        self.load_filter_fields()
    }

    /// Publish a complete set of filter settings
    pub fn set_filter(&self, settings: FilterSettings) {
        let _guard = self.filter_write.lock();
        let seq = self.filter_seq.load(Ordering::Relaxed);
        self.filter_seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.filter_mode.store(settings.mode as u8, Ordering::Relaxed);
        self.filter_frequency.store(settings.frequency);
        self.filter_bandwidth.store(settings.bandwidth);
        self.filter_gain_db.store(settings.gain_db);
        self.filter_enabled.store(settings.enabled, Ordering::Relaxed);

        self.filter_seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Sequence of the last completed filter write
    #[inline]
    pub fn filter_version(&self) -> u32 {
        self.filter_seq.load(Ordering::Acquire) & !1
    }

    /// Lock-free consistent read for the audio thread. Returns `None` when
    /// a write overlapped the read; the caller keeps its previous settings.
    pub fn try_read_filter(&self) -> Option<(u32, FilterSettings)> {
        let before = self.filter_seq.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }
        let settings = self.load_filter_fields();
        fence(Ordering::Acquire);
        let after = self.filter_seq.load(Ordering::Relaxed);
        (before == after).then_some((before, settings))
    }
}

impl Default for TrackParams {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACK (render side)
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) struct Track {
    pub id: TrackId,
    pub name: String,
    pub params: Arc<TrackParams>,
    pub streamer: Option<FileStreamer>,
    /// Source channels handed to the spatializer (1 or 2)
    pub channels: usize,
    pub spatial: SpatialTrack,
    pub source: SpatialSource,
    filter: BiquadFilter,
    filter_enabled: bool,
    filter_settings: FilterSettings,
    filter_version: Option<u32>,
}

impl Track {
    pub fn new(
        id: TrackId,
        name: String,
        params: Arc<TrackParams>,
        spatial: SpatialTrack,
        sample_rate: f64,
    ) -> Self {
        Self {
            id,
            name,
            params,
            streamer: None,
            channels: 2,
            spatial,
            source: SpatialSource::default(),
            filter: BiquadFilter::new(FilterMode::Peaking, sample_rate),
            filter_enabled: false,
            filter_settings: FilterSettings::default(),
            filter_version: None,
        }
    }

    /// Swap in a new source; returns the previous one for the caller to close
    pub fn attach(&mut self, streamer: FileStreamer) -> Option<FileStreamer> {
        let channels = streamer.channels();
        if channels != self.channels {
            self.filter.reset();
            self.spatial.reset();
            self.channels = channels;
        }
        self.streamer.replace(streamer)
    }

    /// Block boundary: pick up parameter changes published since the last block
    pub fn sync_params(&mut self) {
        if self.filter_version != Some(self.params.filter_version()) {
            // A write racing the read is picked up at a later block
            for _ in 0..FILTER_READ_ATTEMPTS {
                if let Some((version, settings)) = self.params.try_read_filter() {
                    self.apply_filter_settings(settings);
                    self.filter_version = Some(version);
                    break;
                }
                std::hint::spin_loop();
            }
        }

        self.source.position = self.params.position();
        self.source.velocity = self.params.velocity();
    }

    fn apply_filter_settings(&mut self, settings: FilterSettings) {
        self.filter.set_params(
            settings.mode,
            settings.frequency,
            settings.bandwidth,
            settings.gain_db,
        );
        if settings.enabled && !self.filter_enabled {
            self.filter.reset();
        }
        self.filter_enabled = settings.enabled;
        self.filter_settings = settings;
    }

    /// Filter settings the renderer is currently running
    pub fn active_filter(&self) -> FilterSettings {
        self.filter_settings
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled
    }

    /// Run the EQ band over `frames` interleaved frames
    pub fn apply_filter(&mut self, buffer: &mut [Sample], frames: usize) {
        if !self.filter_enabled {
            return;
        }
        let buffer = &mut buffer[..frames * self.channels];
        match self.channels {
            1 => self.filter.process_block(buffer),
            _ => self.filter.process_stereo(buffer),
        }
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("streamer", &self.streamer)
            .finish()
    }
}
