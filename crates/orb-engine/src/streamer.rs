//! File streaming
//!
//! A `FileStreamer` owns one IO thread that decodes ahead into a
//! `StreamRing`; the audio thread pulls from the ring without locking.
//!
//! Seek protocol:
//! 1. `seek` publishes `(generation, target)` and wakes the IO thread
//! 2. the IO thread repositions the decoder and publishes a flush marker
//!    `(generation, write position)`
//! 3. the reader discards everything before the marker
//!
//! Until step 3 the reader outputs silence. Each ring index keeps a single
//! writer throughout.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use orb_core::thread::{join_with_timeout, lower_current_thread_priority, spawn_named};
use orb_core::{BufferPool, MemoryMonitor, Sample};
use orb_file::{SourceDecoder, SourceSpec};

use crate::config::StreamerConfig;
use crate::error::{EngineError, EngineResult};
use crate::ring::StreamRing;

const GEN_SHIFT: u32 = 48;
const VALUE_MASK: u64 = (1 << GEN_SHIFT) - 1;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn pack(generation: u64, value: u64) -> u64 {
    ((generation & 0xFFFF) << GEN_SHIFT) | (value & VALUE_MASK)
}

#[inline]
fn unpack(packed: u64) -> (u64, u64) {
    (packed >> GEN_SHIFT, packed & VALUE_MASK)
}

/// Playback channels for a file: mono stays mono, anything wider plays as stereo
pub fn playback_channels(file_channels: u16) -> usize {
    if file_channels <= 1 { 1 } else { 2 }
}

// ═══════════════════════════════════════════════════════════════════════════
// STREAM STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Reader-side state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum StreamState {
    /// Closed
    Stopped = 0,
    /// Filling after open or seek; short reads are not underruns
    Priming = 1,
    Running = 2,
    /// Last read found the ring empty
    Starved = 3,
    /// End of data reached and drained (not looping)
    Finished = 4,
}

impl From<u8> for StreamState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Priming,
            2 => Self::Running,
            3 => Self::Starved,
            4 => Self::Finished,
            _ => Self::Stopped,
        }
    }
}

/// Outcome of one `read`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Every requested frame came from the source
    Full,
    /// Source ended; this many frames were real, the rest silence
    EndOfData(usize),
    /// Ring ran dry; output is silence and the underrun was counted
    Underrun,
    /// Priming or waiting on a seek; output is silence
    Pending,
    /// Streamer closed; output is silence
    Closed,
}

impl ReadStatus {
    /// Frames of source audio delivered, out of `requested`
    pub fn frames(self, requested: usize) -> usize {
        match self {
            Self::Full => requested,
            Self::EndOfData(n) => n,
            Self::Underrun | Self::Pending | Self::Closed => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════

struct StreamShared {
    label: String,
    ring: StreamRing,
    spec: SourceSpec,
    chunk_frames: usize,
    open: AtomicBool,
    looping: AtomicBool,
    /// Decoder hit the end and is not looping (IO thread)
    end_of_data: AtomicBool,
    /// `(generation, target frame)` (control plane)
    seek_request: AtomicU64,
    /// `(generation, ring write position)` (IO thread)
    flush_marker: AtomicU64,
    /// Target of the latest flush (IO thread)
    flush_target: AtomicU64,
    /// Generation the reader has flushed to (reader)
    reader_generation: AtomicU64,
    /// Source frame of the next frame handed out (reader)
    playback_frame: AtomicU64,
    /// Reader
    state: AtomicU8,
    underruns: AtomicU64,
    wake: Sender<()>,
}

impl StreamShared {
    #[inline]
    fn wake(&self) {
        // A pending wakeup is as good as a new one
        let _ = self.wake.try_send(());
    }

    #[inline]
    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn seek_pending(&self) -> bool {
        let (requested, _) = unpack(self.seek_request.load(Ordering::Acquire));
        let (flushed, _) = unpack(self.flush_marker.load(Ordering::Acquire));
        requested != flushed
    }

    /// Frames readable at the current position, ignoring stale pre-seek frames
    fn fresh_frames(&self) -> usize {
        let (flushed, marker) = unpack(self.flush_marker.load(Ordering::Acquire));
        if flushed == self.reader_generation.load(Ordering::Acquire) {
            self.ring.available_read()
        } else {
            self.ring.write_position().saturating_sub(marker) as usize
        }
    }

    /// Pre-seek frames the reader has not discarded yet
    fn stale_frames(&self) -> usize {
        let (flushed, marker) = unpack(self.flush_marker.load(Ordering::Acquire));
        if flushed == self.reader_generation.load(Ordering::Acquire) {
            0
        } else {
            marker.saturating_sub(self.ring.read_position()) as usize
        }
    }

    fn advance(&self, frames: usize) {
        let next = self.playback_frame.load(Ordering::Relaxed) + frames as u64;
        self.playback_frame.store(self.wrap(next), Ordering::Release);
    }

    fn wrap(&self, frame: u64) -> u64 {
        let total = self.spec.total_frames;
        if total == 0 {
            frame
        } else if self.looping.load(Ordering::Relaxed) {
            frame % total
        } else {
            frame.min(total)
        }
    }

    fn is_finished(&self) -> bool {
        self.open.load(Ordering::Acquire)
            && self.end_of_data.load(Ordering::Acquire)
            && !self.looping.load(Ordering::Acquire)
            && !self.seek_pending()
            && self.fresh_frames() == 0
    }

    /// Audio-thread read. Never blocks or allocates.
    fn read(&self, output: &mut [Sample], frames: usize) -> ReadStatus {
        let ch = self.ring.channels();
        let frames = frames.min(output.len() / ch);
        let output = &mut output[..frames * ch];

        if !self.open.load(Ordering::Acquire) {
            output.fill(0.0);
            return ReadStatus::Closed;
        }
        if self.seek_pending() {
            output.fill(0.0);
            self.wake();
            return ReadStatus::Pending;
        }

        let (flushed, marker) = unpack(self.flush_marker.load(Ordering::Acquire));
        if flushed != self.reader_generation.load(Ordering::Relaxed) {
            // Frames past the marker already consumed belong to the new position
            let overshoot = self.ring.read_position().saturating_sub(marker);
            self.ring.discard_until(marker);
            let target = self.flush_target.load(Ordering::Acquire);
            self.playback_frame.store(self.wrap(target + overshoot), Ordering::Release);
            self.reader_generation.store(flushed, Ordering::Release);
            self.set_state(StreamState::Priming);
            self.wake();
        }
        if frames == 0 {
            return ReadStatus::Full;
        }

        if self.ring.available_read() >= frames {
            self.ring.read(output, frames);
            self.advance(frames);
            self.set_state(StreamState::Running);
            if self.ring.available_write() >= self.chunk_frames {
                self.wake();
            }
            return ReadStatus::Full;
        }

        if self.end_of_data.load(Ordering::Acquire) && !self.looping.load(Ordering::Acquire) {
            let n = self.ring.read(output, frames);
            self.advance(n);
            if self.ring.available_read() == 0 {
                self.set_state(StreamState::Finished);
            }
            return ReadStatus::EndOfData(n);
        }

        output.fill(0.0);
        self.wake();
        if StreamState::from(self.state.load(Ordering::Relaxed)) == StreamState::Priming {
            return ReadStatus::Pending;
        }
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.set_state(StreamState::Starved);
        ReadStatus::Underrun
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL HANDLE
// ═══════════════════════════════════════════════════════════════════════════

/// Control-plane view of a streamer: seek, loop and status, no reads
#[derive(Clone)]
pub struct StreamControl {
    shared: Arc<StreamShared>,
}

impl StreamControl {
    /// Request playback from `frame`, clamped to the last frame.
    /// Returns the clamped target.
    pub fn seek(&self, frame: u64) -> u64 {
        let total = self.shared.spec.total_frames;
        let target = if total > 0 { frame.min(total - 1) } else { frame };
        let _ = self
            .shared
            .seek_request
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (generation, _) = unpack(packed);
                Some(pack(generation.wrapping_add(1), target))
            });
        self.shared.wake();
        log::debug!("{}: seek to frame {}", self.shared.label, target);
        target
    }

    pub fn set_loop(&self, enabled: bool) {
        self.shared.looping.store(enabled, Ordering::Release);
        self.shared.wake();
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Source ended without looping and every frame has been read
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn state(&self) -> StreamState {
        if !self.is_open() {
            return StreamState::Stopped;
        }
        StreamState::from(self.shared.state.load(Ordering::Acquire))
    }

    pub fn playback_frame(&self) -> u64 {
        self.shared.playback_frame.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> u64 {
        self.shared.spec.total_frames
    }

    pub fn source_spec(&self) -> SourceSpec {
        self.shared.spec
    }

    pub fn channels(&self) -> usize {
        self.shared.ring.channels()
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Frames ready for the reader at the current position
    pub fn available_frames(&self) -> usize {
        if self.shared.seek_pending() {
            0
        } else {
            self.shared.fresh_frames()
        }
    }

    pub fn fill_level(&self) -> f32 {
        self.available_frames() as f32 / (self.shared.ring.capacity_frames() - 1) as f32
    }

    pub fn capacity_frames(&self) -> usize {
        self.shared.ring.capacity_frames()
    }

    /// Block until `min_frames` are buffered (or the source ends).
    /// Returns false on timeout.
    ///
    /// Frames still queued ahead of a seek's flush marker take ring space
    /// until the reader discards them, so the wait is capped at what fits.
    pub fn wait_primed(&self, min_frames: usize, timeout: Duration) -> bool {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_open() {
                return false;
            }
            if !shared.seek_pending() {
                let room = (shared.ring.capacity_frames() - 1).saturating_sub(shared.stale_frames());
                let ended = shared.end_of_data.load(Ordering::Acquire)
                    && !shared.looping.load(Ordering::Acquire);
                if ended || shared.fresh_frames() >= min_frames.min(room) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.shared.wake();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .field("playback_frame", &self.playback_frame())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FILE STREAMER
// ═══════════════════════════════════════════════════════════════════════════

/// One source, one IO thread, one ring
pub struct FileStreamer {
    control: StreamControl,
    io_thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl FileStreamer {
    /// Open `path` and start decoding ahead.
    ///
    /// `channels` is the playback channel count (1 or 2); `sample_rate` is
    /// the engine rate the ring is sized for.
    pub fn open<P: AsRef<Path>>(
        path: P,
        channels: usize,
        sample_rate: u32,
        config: &StreamerConfig,
        pool: &BufferPool,
    ) -> EngineResult<Self> {
        let path = path.as_ref();
        let decoder = SourceDecoder::open(path)?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::start(decoder, label, channels, sample_rate, config, pool)
    }

    /// Stream from an already opened decoder
    pub fn from_decoder(
        decoder: SourceDecoder,
        channels: usize,
        sample_rate: u32,
        config: &StreamerConfig,
        pool: &BufferPool,
    ) -> EngineResult<Self> {
        Self::from_named_decoder(decoder, "memory", channels, sample_rate, config, pool)
    }

    /// Stream from an already opened decoder, labelled `name` in logs
    pub fn from_named_decoder(
        decoder: SourceDecoder,
        name: &str,
        channels: usize,
        sample_rate: u32,
        config: &StreamerConfig,
        pool: &BufferPool,
    ) -> EngineResult<Self> {
        Self::start(decoder, name.to_string(), channels, sample_rate, config, pool)
    }

    fn start(
        decoder: SourceDecoder,
        name: String,
        channels: usize,
        sample_rate: u32,
        config: &StreamerConfig,
        pool: &BufferPool,
    ) -> EngineResult<Self> {
        config.validate()?;
        if channels == 0 || channels > 2 {
            return Err(EngineError::InvalidArg(format!(
                "streamer playback channels must be 1 or 2, got {}",
                channels
            )));
        }

        let spec = decoder.spec();
        if spec.sample_rate != sample_rate {
            log::warn!(
                "{}: file rate {} Hz differs from engine rate {} Hz, playing unresampled",
                name,
                spec.sample_rate,
                sample_rate
            );
        }

        let memory = MemoryMonitor::global();
        let low_memory = {
            memory.refresh_if_due();
            memory.is_low()
        };
        let capacity = config.ring_frames(sample_rate, low_memory);
        if low_memory {
            log::info!("{}: memory pressure, ring reduced to {} frames", name, capacity);
        }

        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let label = format!("streamer-{}:{}", id, name);
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(StreamShared {
            label: label.clone(),
            ring: StreamRing::new(capacity, channels),
            spec,
            chunk_frames: config.chunk_frames,
            open: AtomicBool::new(true),
            looping: AtomicBool::new(false),
            end_of_data: AtomicBool::new(false),
            seek_request: AtomicU64::new(pack(0, 0)),
            flush_marker: AtomicU64::new(pack(0, 0)),
            flush_target: AtomicU64::new(0),
            reader_generation: AtomicU64::new(0),
            playback_frame: AtomicU64::new(0),
            state: AtomicU8::new(StreamState::Priming as u8),
            underruns: AtomicU64::new(0),
            wake: wake_tx,
        });
        memory.register(&label, shared.ring.footprint_bytes());

        let worker = IoWorker {
            shared: Arc::clone(&shared),
            decoder,
            wake: wake_rx,
            pool: pool.clone(),
            idle_wait: config.idle_wait(),
            empty: false,
        };
        let io_thread = match spawn_named("orb-io-read", move || worker.run()) {
            Ok(handle) => handle,
            Err(e) => {
                memory.unregister(&label);
                return Err(e.into());
            }
        };

        log::info!(
            "Streamer opened: {} ({} ch -> {} ch, {} Hz, {} frames, ring {} frames)",
            label,
            spec.channels,
            channels,
            spec.sample_rate,
            spec.total_frames,
            capacity
        );

        Ok(Self {
            control: StreamControl { shared },
            io_thread: Some(io_thread),
            join_timeout: config.join_timeout(),
        })
    }

    /// RT-safe: fill `output` with `frames` interleaved frames.
    ///
    /// Never fails; anything that is not source audio is silence.
    #[inline]
    pub fn read(&self, output: &mut [Sample], frames: usize) -> ReadStatus {
        self.control.shared.read(output, frames)
    }

    pub fn controller(&self) -> StreamControl {
        self.control.clone()
    }

    pub fn seek(&self, frame: u64) -> u64 {
        self.control.seek(frame)
    }

    pub fn set_loop(&self, enabled: bool) {
        self.control.set_loop(enabled)
    }

    pub fn is_looping(&self) -> bool {
        self.control.is_looping()
    }

    pub fn is_open(&self) -> bool {
        self.control.is_open()
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    pub fn state(&self) -> StreamState {
        self.control.state()
    }

    pub fn playback_frame(&self) -> u64 {
        self.control.playback_frame()
    }

    pub fn total_frames(&self) -> u64 {
        self.control.total_frames()
    }

    pub fn channels(&self) -> usize {
        self.control.channels()
    }

    pub fn underruns(&self) -> u64 {
        self.control.underruns()
    }

    pub fn available_frames(&self) -> usize {
        self.control.available_frames()
    }

    pub fn fill_level(&self) -> f32 {
        self.control.fill_level()
    }

    pub fn wait_primed(&self, min_frames: usize, timeout: Duration) -> bool {
        self.control.wait_primed(min_frames, timeout)
    }

    /// Stop the IO thread (bounded wait) and release the ring accounting
    pub fn close(&mut self) {
        let Some(handle) = self.io_thread.take() else {
            return;
        };
        let shared = &self.control.shared;
        shared.open.store(false, Ordering::Release);
        shared.wake();
        if !join_with_timeout(handle, self.join_timeout) {
            log::error!("{}: IO thread did not stop, detached", shared.label);
        }
        MemoryMonitor::global().unregister(&shared.label);
        log::info!(
            "Streamer closed: {} ({} underruns)",
            shared.label,
            shared.underruns.load(Ordering::Relaxed)
        );
    }
}

impl Drop for FileStreamer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FileStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.control.fmt(f)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IO THREAD
// ═══════════════════════════════════════════════════════════════════════════

struct IoWorker {
    shared: Arc<StreamShared>,
    decoder: SourceDecoder,
    wake: Receiver<()>,
    pool: BufferPool,
    idle_wait: Duration,
    /// Source produced nothing even from frame 0; looping cannot help
    empty: bool,
}

impl IoWorker {
    fn run(mut self) {
        let _ = lower_current_thread_priority();

        let shared = Arc::clone(&self.shared);
        let chunk = shared.chunk_frames;
        let src_channels = shared.spec.channels as usize;
        let out_channels = shared.ring.channels();
        let mut decoded = self.pool.acquire(chunk, src_channels);
        let mut adapted = self.pool.acquire(chunk, out_channels);
        if !decoded.is_valid() || !adapted.is_valid() {
            log::error!("{}: no scratch memory, stream stays silent", shared.label);
            shared.end_of_data.store(true, Ordering::Release);
            return;
        }

        let mut generation = 0;
        while shared.open.load(Ordering::Acquire) {
            let (requested, target) = unpack(shared.seek_request.load(Ordering::Acquire));
            if requested != generation {
                if let Err(e) = self.decoder.seek(target) {
                    log::warn!("{}: seek to {} failed: {}", shared.label, target, e);
                }
                shared.end_of_data.store(false, Ordering::Release);
                shared.flush_target.store(target, Ordering::Release);
                shared
                    .flush_marker
                    .store(pack(requested, shared.ring.write_position()), Ordering::Release);
                generation = requested;
            }

            if shared.end_of_data.load(Ordering::Acquire)
                && shared.looping.load(Ordering::Acquire)
                && !self.empty
            {
                self.restart();
            }

            let room = shared.ring.available_write();
            let ready = !shared.end_of_data.load(Ordering::Acquire);
            if ready && room >= chunk.min(shared.ring.capacity_frames() - 1) {
                let want = room.min(chunk);
                let (frames, ended) = self.fill(decoded.as_mut_slice(), want);
                if frames > 0 {
                    adapt_channels(
                        decoded.as_slice(),
                        src_channels,
                        adapted.as_mut_slice(),
                        out_channels,
                        frames,
                    );
                    shared.ring.write(adapted.as_slice(), frames);
                }
                if ended {
                    // Only after the final frames are visible to the reader
                    shared.end_of_data.store(true, Ordering::Release);
                    log::debug!("{}: end of data", shared.label);
                }
                if frames > 0 {
                    continue;
                }
            }

            match self.wake.recv_timeout(self.idle_wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("{}: IO thread exiting", shared.label);
    }

    fn restart(&mut self) {
        if let Err(e) = self.decoder.seek(0) {
            log::warn!("{}: loop restart failed: {}", self.shared.label, e);
            return;
        }
        self.shared.end_of_data.store(false, Ordering::Release);
    }

    /// Decode up to `frames` frames, wrapping to the start while looping.
    /// Returns frames decoded and whether the source ended.
    fn fill(&mut self, buffer: &mut [Sample], frames: usize) -> (usize, bool) {
        let ch = self.shared.spec.channels as usize;
        let mut filled = 0;
        let mut rewound_empty = false;

        while filled < frames {
            match self.decoder.read(&mut buffer[filled * ch..frames * ch]) {
                Ok(0) => {
                    if rewound_empty {
                        self.empty = true;
                        return (filled, true);
                    }
                    if !self.shared.looping.load(Ordering::Acquire) {
                        return (filled, true);
                    }
                    if let Err(e) = self.decoder.seek(0) {
                        log::warn!("{}: loop restart failed: {}", self.shared.label, e);
                        return (filled, true);
                    }
                    rewound_empty = true;
                }
                Ok(n) => {
                    filled += n;
                    rewound_empty = false;
                }
                Err(e) => {
                    log::error!("{}: decode error: {}", self.shared.label, e);
                    return (filled, true);
                }
            }
        }
        (filled, false)
    }
}

/// Map interleaved frames between channel counts: mono is duplicated,
/// wider sources fold to mono by averaging or keep their leading channels.
pub fn adapt_channels(
    src: &[Sample],
    src_channels: usize,
    dst: &mut [Sample],
    dst_channels: usize,
    frames: usize,
) {
    let frames = frames
        .min(src.len() / src_channels.max(1))
        .min(dst.len() / dst_channels.max(1));
    if src_channels == dst_channels {
        let n = frames * src_channels;
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    let src_frames = src.chunks_exact(src_channels).take(frames);
    let dst_frames = dst.chunks_exact_mut(dst_channels);
    for (s, d) in src_frames.zip(dst_frames) {
        if src_channels == 1 {
            d.fill(s[0]);
        } else if dst_channels == 1 {
            d[0] = s.iter().sum::<Sample>() / src_channels as Sample;
        } else {
            let shared = src_channels.min(dst_channels);
            d[..shared].copy_from_slice(&s[..shared]);
            d[shared..].fill(0.0);
        }
    }
}
