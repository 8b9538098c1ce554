//! Mixer engine
//!
//! Provides:
//! - Track registry (insertion order is mix order)
//! - The real-time `render` entry point driven by the host's device sink
//! - Per-track EQ, spatialization and metering
//! - Master volume, master meter and optional recording
//!
//! Threading: control threads call everything except `render`. `render`
//! only ever `try_lock`s the graph; a block that finds it locked renders
//! silence and counts as contention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use orb_core::logging::{DEFAULT_RT_LOG_CAPACITY, rt_channel};
use orb_core::{BufferPool, Clock, LogLevel, MemoryMonitor, RtLogReader, RtLogWriter, Sample, rt_log};
use orb_dsp::{DenormalGuard, LevelMeter, LevelReading};
use orb_file::{AsyncWriter, SourceDecoder, WriteRequest, WriterConfig, WriterStats};
use orb_spatial::{
    HrtfDatabase, Listener, OutputLayout, SceneFlags, SpatialMode, SpatialProcessor, SpatialScene,
    Vec3,
};
use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::meter::{AtomicF32, MeterData};
use crate::stats::{EngineCounters, EngineStats};
use crate::streamer::{FileStreamer, ReadStatus, StreamControl, playback_channels};
use crate::track::{FilterSettings, Track, TrackId, TrackParams};

/// Pool buffers per size class filled before the first block
const PREWARM_PER_CLASS: usize = 8;

/// Convenience constructor with default settings for everything else
pub fn create_engine(sample_rate: u32, buffer_frames: usize, channels: usize) -> EngineResult<Engine> {
    Engine::new(EngineConfig::new(sample_rate, buffer_frames, channels))
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDER GRAPH (audio thread, behind try_lock)
// ═══════════════════════════════════════════════════════════════════════════

struct RenderGraph {
    tracks: Vec<Track>,
    spatial: SpatialProcessor,
    recorder: Option<Arc<AsyncWriter>>,
    rt_log: RtLogWriter,
}

/// Control-plane view of one track
struct TrackHandle {
    params: Arc<TrackParams>,
    stream: Option<StreamControl>,
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

pub struct Engine {
    config: EngineConfig,
    layout: OutputLayout,
    pool: BufferPool,
    meter: LevelMeter,
    graph: Mutex<RenderGraph>,
    handles: RwLock<HashMap<TrackId, TrackHandle>>,
    next_id: AtomicU32,
    running: AtomicBool,
    master_volume: AtomicF32,
    master_meter: MeterData,
    spatial_mode: AtomicU8,
    /// Control copy of the scene
    scene: Mutex<SpatialScene>,
    /// Scene waiting for the next block boundary
    pending_scene: Mutex<Option<SpatialScene>>,
    recording: Mutex<Option<Arc<AsyncWriter>>>,
    last_recording: Mutex<Option<WriterStats>>,
    /// Drops of finished recordings
    past_write_drops: AtomicU64,
    rt_log: Mutex<RtLogReader>,
    counters: EngineCounters,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let sample_rate = config.sample_rate as f64;

        let pool = BufferPool::with_retention(config.pool.class_capacity, config.pool.retention);
        for channels in [1, 2, layout.channel_count()] {
            pool.prewarm(config.buffer_frames, channels, PREWARM_PER_CLASS);
        }

        let scene = config.spatial.scene();
        let mut spatial = SpatialProcessor::new(sample_rate, layout);
        spatial.set_scene(scene);
        spatial.set_mode(config.spatial_mode);
        spatial.begin_block();

        let (rt_writer, rt_reader) = rt_channel(DEFAULT_RT_LOG_CAPACITY);

        log::info!(
            "Engine created: {} Hz, {} frames, {} channels, {} mode",
            config.sample_rate,
            config.buffer_frames,
            layout.channel_count(),
            config.spatial_mode.name()
        );

        Ok(Self {
            layout,
            pool,
            meter: LevelMeter::new(),
            graph: Mutex::new(RenderGraph {
                tracks: Vec::new(),
                spatial,
                recorder: None,
                rt_log: rt_writer,
            }),
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            running: AtomicBool::new(false),
            master_volume: AtomicF32::new(1.0),
            master_meter: MeterData::new(),
            spatial_mode: AtomicU8::new(config.spatial_mode as u8),
            scene: Mutex::new(scene),
            pending_scene: Mutex::new(None),
            recording: Mutex::new(None),
            last_recording: Mutex::new(None),
            past_write_drops: AtomicU64::new(0),
            rt_log: Mutex::new(rt_reader),
            counters: EngineCounters::default(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn buffer_frames(&self) -> usize {
        self.config.buffer_frames
    }

    pub fn channels(&self) -> usize {
        self.layout.channel_count()
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // ───────────────────────────────────────────────────────────────────────
    // Transport
    // ───────────────────────────────────────────────────────────────────────

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            log::info!("Engine started");
        }
    }

    /// Stop rendering and tear down every track and the recorder.
    ///
    /// IO threads are joined with the configured bound; a thread that does
    /// not stop in time is logged and detached.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        let (tracks, recorder) = {
            let mut graph = self.graph.lock();
            (std::mem::take(&mut graph.tracks), graph.recorder.take())
        };
        self.handles.write().clear();

        let count = tracks.len();
        for mut track in tracks {
            if let Some(mut streamer) = track.streamer.take() {
                streamer.close();
            }
        }
        drop(recorder);
        if self.is_recording()
            && let Err(e) = self.stop_recording()
        {
            log::warn!("Failed to stop recording during engine stop: {}", e);
        }
        self.master_meter.reset();
        self.drain_log();

        if was_running || count > 0 {
            log::info!("Engine stopped ({} tracks released)", count);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clamped to 0..=2
    pub fn set_master_volume(&self, volume: f32) -> EngineResult<()> {
        let volume = finite(volume, "master volume")?;
        self.master_volume.store(volume.clamp(0.0, 2.0));
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.load()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Track registry
    // ───────────────────────────────────────────────────────────────────────

    pub fn add_track(&self, name: &str) -> TrackId {
        let id = TrackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let params = Arc::new(TrackParams::new());

        {
            let mut graph = self.graph.lock();
            let spatial = graph.spatial.create_track();
            let track = Track::new(
                id,
                name.to_string(),
                Arc::clone(&params),
                spatial,
                self.config.sample_rate as f64,
            );
            graph.tracks.push(track);
        }
        self.handles.write().insert(id, TrackHandle { params, stream: None });

        log::info!("Track added: {} ({})", id, name);
        id
    }

    pub fn remove_track(&self, id: TrackId) -> EngineResult<()> {
        let removed = {
            let mut graph = self.graph.lock();
            let index = graph
                .tracks
                .iter()
                .position(|t| t.id == id)
                .ok_or(EngineError::TrackNotFound(id))?;
            graph.tracks.remove(index)
        };
        self.handles.write().remove(&id);

        // Joins the IO thread outside the graph lock
        let Track { name, streamer, .. } = removed;
        drop(streamer);
        log::info!("Track removed: {} ({})", id, name);
        Ok(())
    }

    pub fn rename_track(&self, id: TrackId, name: &str) -> EngineResult<()> {
        let mut graph = self.graph.lock();
        let track = graph
            .tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(EngineError::TrackNotFound(id))?;
        track.name = name.to_string();
        Ok(())
    }

    pub fn track_name(&self, id: TrackId) -> EngineResult<String> {
        let graph = self.graph.lock();
        graph
            .tracks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.name.clone())
            .ok_or(EngineError::TrackNotFound(id))
    }

    /// Track ids in mix order
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.graph.lock().tracks.iter().map(|t| t.id).collect()
    }

    pub fn track_count(&self) -> usize {
        self.handles.read().len()
    }

    fn with_params<R>(&self, id: TrackId, f: impl FnOnce(&TrackParams) -> R) -> EngineResult<R> {
        let handles = self.handles.read();
        let handle = handles.get(&id).ok_or(EngineError::TrackNotFound(id))?;
        Ok(f(&handle.params))
    }

    fn stream(&self, id: TrackId) -> EngineResult<StreamControl> {
        let handles = self.handles.read();
        let handle = handles.get(&id).ok_or(EngineError::TrackNotFound(id))?;
        handle
            .stream
            .clone()
            .ok_or_else(|| EngineError::InvalidArg(format!("track {} has no source", id)))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Track parameters (lock-free)
    // ───────────────────────────────────────────────────────────────────────

    /// Clamped to 0..=1
    pub fn set_track_volume(&self, id: TrackId, volume: f32) -> EngineResult<()> {
        let volume = finite(volume, "track volume")?;
        self.with_params(id, |p| p.set_volume(volume))
    }

    /// -1 = left, 0 = center, 1 = right; only audible in `Basic` mode
    pub fn set_track_pan(&self, id: TrackId, pan: f32) -> EngineResult<()> {
        let pan = finite(pan, "track pan")?;
        self.with_params(id, |p| p.set_pan(pan))
    }

    pub fn set_track_mute(&self, id: TrackId, mute: bool) -> EngineResult<()> {
        self.with_params(id, |p| p.set_mute(mute))
    }

    pub fn set_track_solo(&self, id: TrackId, solo: bool) -> EngineResult<()> {
        self.with_params(id, |p| p.set_solo(solo))
    }

    /// Source position in meters, listener-relative coordinates follow the scene
    pub fn set_track_position(&self, id: TrackId, x: f32, y: f32, z: f32) -> EngineResult<()> {
        let position = finite_vec(x, y, z, "track position")?;
        self.with_params(id, |p| p.set_position(position))
    }

    /// Meters per second, used by Doppler
    pub fn set_track_velocity(&self, id: TrackId, x: f32, y: f32, z: f32) -> EngineResult<()> {
        let velocity = finite_vec(x, y, z, "track velocity")?;
        self.with_params(id, |p| p.set_velocity(velocity))
    }

    /// Applied at the next block boundary
    pub fn set_track_filter(&self, id: TrackId, settings: FilterSettings) -> EngineResult<()> {
        let nyquist = self.config.sample_rate as f64 / 2.0;
        if !(settings.frequency > 0.0 && settings.frequency < nyquist) {
            return Err(EngineError::InvalidArg(format!(
                "filter frequency {} outside (0, {})",
                settings.frequency, nyquist
            )));
        }
        if !(settings.bandwidth > 0.0) || !settings.gain_db.is_finite() {
            return Err(EngineError::InvalidArg(
                "filter bandwidth must be positive and gain finite".into(),
            ));
        }
        self.with_params(id, |p| p.set_filter(settings))
    }

    /// Shared parameter block, for hosts that automate from their own thread
    pub fn track_params(&self, id: TrackId) -> EngineResult<Arc<TrackParams>> {
        let handles = self.handles.read();
        let handle = handles.get(&id).ok_or(EngineError::TrackNotFound(id))?;
        Ok(Arc::clone(&handle.params))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Sources
    // ───────────────────────────────────────────────────────────────────────

    /// Stream an audio file on track `id`, replacing any previous source
    pub fn load_track<P: AsRef<Path>>(&self, id: TrackId, path: P, looping: bool) -> EngineResult<()> {
        let path = path.as_ref();
        if !self.handles.read().contains_key(&id) {
            return Err(EngineError::TrackNotFound(id));
        }
        let decoder = SourceDecoder::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.install(id, decoder, &name, looping)
    }

    /// Stream from an already opened decoder (synthesized or preloaded audio)
    pub fn attach_source(&self, id: TrackId, decoder: SourceDecoder, looping: bool) -> EngineResult<()> {
        if !self.handles.read().contains_key(&id) {
            return Err(EngineError::TrackNotFound(id));
        }
        self.install(id, decoder, "memory", looping)
    }

    fn install(&self, id: TrackId, decoder: SourceDecoder, name: &str, looping: bool) -> EngineResult<()> {
        let channels = playback_channels(decoder.spec().channels);
        let streamer = FileStreamer::from_named_decoder(
            decoder,
            name,
            channels,
            self.config.sample_rate,
            &self.config.streamer,
            &self.pool,
        )?;
        streamer.set_loop(looping);
        let control = streamer.controller();

        let previous = {
            let mut graph = self.graph.lock();
            let track = graph
                .tracks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(EngineError::TrackNotFound(id))?;
            track.attach(streamer)
        };
        // Closed here, after the graph lock is released
        drop(previous);

        match self.handles.write().get_mut(&id) {
            Some(handle) => handle.stream = Some(control),
            None => return Err(EngineError::TrackNotFound(id)),
        }
        log::info!("Track {} source: {} ({} ch, loop {})", id, name, channels, looping);
        Ok(())
    }

    /// Returns the clamped target frame
    pub fn seek_track(&self, id: TrackId, frame: u64) -> EngineResult<u64> {
        Ok(self.stream(id)?.seek(frame))
    }

    pub fn set_track_loop(&self, id: TrackId, looping: bool) -> EngineResult<()> {
        self.stream(id)?.set_loop(looping);
        Ok(())
    }

    /// Seek, loop and status handle of the track's source
    pub fn track_stream(&self, id: TrackId) -> EngineResult<StreamControl> {
        self.stream(id)
    }

    /// Wait until every source has buffered as much as its ring allows
    /// (or reached its end). Returns false on timeout.
    pub fn wait_until_primed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let streams: Vec<StreamControl> = self
            .handles
            .read()
            .values()
            .filter_map(|h| h.stream.clone())
            .collect();

        let chunk = self.config.streamer.chunk_frames;
        streams.iter().all(|stream| {
            let wanted = stream.capacity_frames().saturating_sub(1 + chunk).max(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            stream.wait_primed(wanted, remaining)
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Spatial scene
    // ───────────────────────────────────────────────────────────────────────

    /// Applied at the next block boundary
    pub fn set_spatial_mode(&self, mode: SpatialMode) {
        let previous = SpatialMode::from(self.spatial_mode.swap(mode as u8, Ordering::AcqRel));
        if previous != mode {
            log::info!("Spatial mode: {} -> {}", previous.name(), mode.name());
        }
    }

    pub fn spatial_mode(&self) -> SpatialMode {
        SpatialMode::from(self.spatial_mode.load(Ordering::Acquire))
    }

    pub fn scene(&self) -> SpatialScene {
        *self.scene.lock()
    }

    pub fn set_scene(&self, scene: SpatialScene) {
        self.update_scene(|s| *s = scene);
    }

    pub fn set_listener(&self, listener: Listener) {
        self.update_scene(|s| s.listener = listener);
    }

    pub fn set_scene_flags(&self, flags: SceneFlags) {
        self.update_scene(|s| s.flags = flags);
    }

    fn update_scene(&self, f: impl FnOnce(&mut SpatialScene)) {
        let mut scene = self.scene.lock();
        f(&mut scene);
        *self.pending_scene.lock() = Some(*scene);
    }

    /// Replace the HRTF set; tracks switch over at their next reset
    pub fn set_hrtf(&self, db: HrtfDatabase) -> EngineResult<()> {
        let entries = db.len();
        self.graph.lock().spatial.set_hrtf(db)?;
        log::info!("HRTF set installed ({} directions)", entries);
        Ok(())
    }

    pub fn load_hrtf<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        self.set_hrtf(HrtfDatabase::load(path)?)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Recording
    // ───────────────────────────────────────────────────────────────────────

    /// Record the master output to `path` from the next block on
    pub fn start_recording<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        let path = path.as_ref();
        let mut slot = self.recording.lock();
        if let Some(active) = slot.as_ref() {
            return Err(EngineError::AlreadyRecording(active.path().display().to_string()));
        }

        let writer = AsyncWriter::start(
            path,
            WriterConfig {
                sample_rate: self.config.sample_rate,
                channels: self.layout.channel_count() as u16,
                format: self.config.writer.format,
                queue_capacity: self.config.writer.queue_capacity,
                enqueue_timeout: Duration::from_millis(self.config.writer.enqueue_timeout_ms),
            },
        )?;
        let writer = Arc::new(writer);
        self.graph.lock().recorder = Some(Arc::clone(&writer));
        *slot = Some(writer);

        log::info!("Recording started: {}", path.display());
        Ok(())
    }

    /// Flush and finalize the recording
    pub fn stop_recording(&self) -> EngineResult<WriterStats> {
        let mut slot = self.recording.lock();
        let writer = slot.take().ok_or(EngineError::NotRecording)?;
        // The audio thread holds no reference after this
        drop(self.graph.lock().recorder.take());

        let path: PathBuf = writer.path().to_path_buf();
        let stats = match Arc::try_unwrap(writer) {
            Ok(mut writer) => writer.stop(),
            Err(shared) => {
                log::warn!("Recorder still referenced, finalizing on drop");
                shared.stats()
            }
        };
        self.past_write_drops
            .fetch_add(stats.total_dropped(), Ordering::Relaxed);
        *self.last_recording.lock() = Some(stats);

        log::info!(
            "Recording stopped: {} ({} frames, {} dropped)",
            path.display(),
            stats.frames_written,
            stats.total_dropped()
        );
        Ok(stats)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.lock().is_some()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Meters & stats
    // ───────────────────────────────────────────────────────────────────────

    /// Levels of the track's last rendered block (post spatializer)
    pub fn track_levels(&self, id: TrackId) -> EngineResult<LevelReading> {
        self.with_params(id, |p| p.meter.load())
    }

    /// Levels of the last `render` call's master output
    pub fn master_levels(&self) -> LevelReading {
        self.master_meter.load()
    }

    /// Forward queued audio-thread log records to `log`
    pub fn drain_log(&self) -> usize {
        self.rt_log.lock().drain()
    }

    pub fn stats(&self) -> EngineStats {
        let pool = self.pool.stats();
        let current = self.recording.lock().as_ref().map(|w| w.stats());
        let recording = current.or(*self.last_recording.lock());
        let write_drops = self.past_write_drops.load(Ordering::Relaxed)
            + current.map(|s| s.total_dropped()).unwrap_or(0);

        EngineStats {
            cpu_load: self.counters.cpu_load.load(),
            underruns: self.counters.underruns(),
            write_drops,
            pool_hits: pool.hit_count,
            pool_misses: pool.miss_count,
            contention: self.counters.contention(),
            blocks_rendered: self.counters.blocks_rendered(),
            rt_log_dropped: self.rt_log.lock().dropped(),
            spatial_load: self.counters.spatial_load.load(),
            latency_samples: self.counters.latency_samples(),
            recording,
            memory_pressure: MemoryMonitor::global().refresh_if_due(),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Render (audio thread)
    // ───────────────────────────────────────────────────────────────────────

    /// Fill `output` with `frames` interleaved frames of the master mix.
    ///
    /// RT-safe: no allocation beyond pool acquire, no blocking locks, no
    /// I/O. Requests larger than `buffer_frames` run in sub-blocks.
    pub fn render(&self, output: &mut [Sample], frames: usize) {
        let channels = self.layout.channel_count();
        let frames = frames.min(output.len() / channels);
        let output = &mut output[..frames * channels];

        // Clear output buffer
        output.fill(0.0);

        if frames == 0 {
            self.master_meter.reset();
            if let Some(graph) = self.graph.try_lock() {
                for track in &graph.tracks {
                    track.params.meter.reset();
                }
            }
            return;
        }

        if !self.running.load(Ordering::Acquire) {
            self.master_meter.reset();
            return;
        }

        let _denormals = DenormalGuard::new();
        let clock = Clock::start();

        let mut graph = match self.graph.try_lock() {
            Some(g) => g,
            None => {
                self.counters.add_contention();
                self.master_meter.reset();
                return;
            }
        };

        let block = self.config.buffer_frames;
        let mut blocks = 0;
        for chunk in output.chunks_mut(block * channels) {
            let n = chunk.len() / channels;
            self.render_block(&mut graph, chunk, n);
            blocks += 1;
        }
        drop(graph);

        self.master_meter
            .store(&self.meter.levels(output, frames, channels));

        self.counters.add_blocks(blocks);
        let budget = frames as f32 / self.config.sample_rate as f32;
        self.counters
            .record_load(clock.elapsed().as_secs_f32() / budget);
    }

    fn render_block(&self, graph: &mut RenderGraph, out: &mut [Sample], frames: usize) {
        let RenderGraph {
            tracks,
            spatial,
            recorder,
            rt_log,
        } = graph;
        let block = self.config.buffer_frames;
        let channels = self.layout.channel_count();

        // Block boundary: scene and mode changes
        if let Some(mut pending) = self.pending_scene.try_lock()
            && let Some(scene) = pending.take()
        {
            spatial.set_scene(scene);
        }
        spatial.set_mode(SpatialMode::from(self.spatial_mode.load(Ordering::Acquire)));
        spatial.begin_block();

        let any_solo = tracks.iter().any(|t| t.params.is_soloed());
        let mut active = 0;

        for track in tracks.iter_mut() {
            let params = Arc::clone(&track.params);
            if params.is_muted() || (any_solo && !params.is_soloed()) {
                params.meter.reset();
                continue;
            }
            track.sync_params();

            let mut input = self.pool.acquire(block, track.channels);
            if !input.is_valid() {
                continue;
            }
            let in_len = frames * track.channels;

            let status = match &track.streamer {
                Some(streamer) => streamer.read(&mut input.as_mut_slice()[..in_len], frames),
                None => {
                    params.meter.reset();
                    continue;
                }
            };
            if status == ReadStatus::Underrun {
                self.counters.add_underrun();
                rt_log!(rt_log, LogLevel::Debug, "track {} underrun", track.id);
            }

            track.apply_filter(input.as_mut_slice(), frames);

            let mut mixed = self.pool.acquire(block, channels);
            if !mixed.is_valid() {
                continue;
            }
            let out_len = frames * channels;
            let result = spatial.process(
                &mut track.spatial,
                &track.source,
                &input.as_slice()[..in_len],
                track.channels,
                frames,
                params.volume(),
                params.pan(),
                &mut mixed.as_mut_slice()[..out_len],
            );
            if let Err(e) = result {
                rt_log!(rt_log, LogLevel::Error, "track {} spatializer: {}", track.id, e);
                params.meter.reset();
                continue;
            }

            let mixed = &mixed.as_slice()[..out_len];
            params.meter.store(&self.meter.levels(mixed, frames, channels));
            for (o, &m) in out.iter_mut().zip(mixed) {
                *o += m;
            }
            active += 1;
        }

        // Master volume
        let master = self.master_volume.load();
        if master != 1.0 {
            out.iter_mut().for_each(|s| *s *= master);
        }

        self.counters
            .spatial_load
            .store(spatial.cpu_load_estimate(active));
        self.counters
            .latency_samples
            .store(spatial.latency_samples() as u64, Ordering::Relaxed);

        // Recording gets its own copy; the pooled buffer travels to the writer
        if let Some(writer) = recorder {
            let mut copy = self.pool.acquire(block, channels);
            if copy.is_valid() {
                copy.as_mut_slice()[..out.len()].copy_from_slice(out);
                writer.queue_request(WriteRequest {
                    buffer: copy,
                    frames,
                    is_last: false,
                });
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sample_rate", &self.config.sample_rate)
            .field("buffer_frames", &self.config.buffer_frames)
            .field("channels", &self.layout.channel_count())
            .field("running", &self.is_running())
            .field("tracks", &self.track_count())
            .finish()
    }
}

fn finite(value: f32, what: &str) -> EngineResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidArg(format!("{} must be finite, got {}", what, value)))
    }
}

fn finite_vec(x: f32, y: f32, z: f32, what: &str) -> EngineResult<Vec3> {
    Ok(Vec3::new(finite(x, what)?, finite(y, what)?, finite(z, what)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::ErrorCode;

    fn constant_source(value: f32, frames: usize, channels: u16) -> SourceDecoder {
        let samples = vec![value; frames * channels as usize];
        SourceDecoder::from_interleaved(samples, channels, 48000).unwrap()
    }

    fn primed_engine() -> Engine {
        let engine = create_engine(48000, 256, 2).unwrap();
        engine.start();
        engine
    }

    #[test]
    fn test_rejects_bad_setup() {
        let err = create_engine(0, 256, 2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
        let err = create_engine(48000, 256, 3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedFormat);
    }

    #[test]
    fn test_track_registry_order() {
        let engine = create_engine(48000, 256, 2).unwrap();
        let a = engine.add_track("a");
        let b = engine.add_track("b");
        let c = engine.add_track("c");
        assert_eq!(engine.track_ids(), vec![a, b, c]);

        engine.remove_track(b).unwrap();
        assert_eq!(engine.track_ids(), vec![a, c]);
        assert_eq!(engine.remove_track(b).unwrap_err().code(), ErrorCode::NotFound);

        engine.rename_track(c, "lead").unwrap();
        assert_eq!(engine.track_name(c).unwrap(), "lead");
    }

    #[test]
    fn test_param_validation() {
        let engine = create_engine(48000, 256, 2).unwrap();
        let id = engine.add_track("t");
        assert!(engine.set_track_volume(id, f32::NAN).is_err());
        assert!(engine.set_track_position(id, 0.0, f32::INFINITY, 0.0).is_err());
        assert_eq!(
            engine.set_track_mute(TrackId(999), true).unwrap_err().code(),
            ErrorCode::NotFound
        );
        let err = engine
            .set_track_filter(id, FilterSettings { frequency: 30000.0, ..FilterSettings::default() })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
        assert_eq!(engine.seek_track(id, 0).unwrap_err().code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_stopped_engine_renders_silence() {
        let engine = create_engine(48000, 256, 2).unwrap();
        let id = engine.add_track("t");
        engine.attach_source(id, constant_source(0.5, 4800, 2), true).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        let mut out = vec![1.0f32; 512];
        engine.render(&mut out, 256);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(engine.stats().blocks_rendered, 0);
    }

    #[test]
    fn test_constant_source_reaches_output() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);
        for &s in &out {
            assert!((s - 0.5).abs() < 1e-4, "sample {}", s);
        }
        let levels = engine.track_levels(id).unwrap();
        assert!((levels.peak - 0.5).abs() < 1e-4);
        assert_eq!(engine.stats().underruns, 0);
    }

    #[test]
    fn test_master_volume_scales_output() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));
        engine.set_master_volume(0.5).unwrap();

        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);
        assert!((out[100] - 0.25).abs() < 1e-4);
        assert!((engine.master_levels().peak - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_solo_silences_others() {
        let engine = primed_engine();
        let a = engine.add_track("a");
        let b = engine.add_track("b");
        engine.attach_source(a, constant_source(0.25, 48000, 2), false).unwrap();
        engine.attach_source(b, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        engine.set_track_solo(a, true).unwrap();
        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);
        assert!((out[10] - 0.25).abs() < 1e-4);
        assert_eq!(engine.track_levels(b).unwrap(), LevelReading::default());
    }

    #[test]
    fn test_oversized_request_runs_in_sub_blocks() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        let mut out = vec![0.0f32; 2 * 1000];
        engine.render(&mut out, 1000);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-4));
        // 256 + 256 + 256 + 232
        assert_eq!(engine.stats().blocks_rendered, 4);
    }

    #[test]
    fn test_contention_renders_silence() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        let guard = engine.graph.lock();
        let mut out = vec![1.0f32; 512];
        engine.render(&mut out, 256);
        drop(guard);

        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(engine.stats().contention, 1);
    }

    #[test]
    fn test_zero_frames_clears_meters() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 48000, 2), false).unwrap();
        assert!(engine.wait_until_primed(Duration::from_secs(2)));

        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);
        assert!(engine.master_levels().peak > 0.0);

        engine.render(&mut out, 0);
        assert_eq!(engine.master_levels(), LevelReading::default());
        assert_eq!(engine.track_levels(id).unwrap(), LevelReading::default());
    }

    #[test]
    fn test_stop_releases_tracks() {
        let engine = primed_engine();
        let id = engine.add_track("dc");
        engine.attach_source(id, constant_source(0.5, 4800, 1), true).unwrap();
        let stream = engine.track_stream(id).unwrap();
        assert!(stream.is_open());

        engine.stop();
        assert!(!engine.is_running());
        assert!(engine.track_ids().is_empty());
        assert!(!stream.is_open());
    }

    #[test]
    fn test_stop_finalizes_active_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.wav");
        let engine = primed_engine();
        engine.start_recording(&path).unwrap();
        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);

        engine.stop();
        assert!(!engine.is_recording());
        let recording = engine.stats().recording.unwrap();
        assert!(!recording.failed);
        assert_eq!(recording.frames_written, 256);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 256);

        // Nothing left to stop
        engine.stop();
        assert_eq!(engine.stop_recording().unwrap_err().code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_scene_changes_apply_at_block_boundary() {
        let engine = primed_engine();
        let mut flags = engine.scene().flags;
        flags.doppler = true;
        engine.set_scene_flags(flags);
        assert!(engine.scene().flags.doppler);

        let mut out = vec![0.0f32; 512];
        engine.render(&mut out, 256);
        assert!(engine.stats().latency_samples > 0);
    }
}
