//! Asynchronous recording writer
//!
//! The audio thread hands pooled buffers to `AsyncWriter::queue`, which
//! waits at most `enqueue_timeout` for the queue lock. A full queue drops
//! its oldest request. A dedicated `orb-io-write` thread at reduced
//! priority drains the queue FIFO into the encoder. Buffers go back to
//! their pool when the request is dropped, whether it was written or not.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use orb_core::AudioBuffer;
use orb_core::thread::{join_with_timeout, lower_current_thread_priority, spawn_named};
use parking_lot::{Condvar, Mutex};

use crate::{FileError, FileResult};

/// Default queue depth in blocks
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default bound on the audio thread's wait for the queue lock
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// How long `stop` waits for the drain to finish
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle re-check interval of the writer thread
const IDLE_WAIT: Duration = Duration::from_millis(100);

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

/// RIFF header, 16-byte `fmt ` chunk and `data` chunk header
const WAV_HEADER_BYTES: usize = 44;

/// Largest `data` chunk a 32-bit RIFF size can describe
const MAX_DATA_BYTES: u64 = u32::MAX as u64 - (WAV_HEADER_BYTES as u64 - 8) - 1;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Sample encoding of the recorded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RecordingFormat {
    /// IEEE float, 32-bit (format tag 3)
    #[default]
    WavFloat32,
    WavPcm24,
    WavPcm16,
}

impl RecordingFormat {
    pub fn bits_per_sample(self) -> u16 {
        match self {
            Self::WavFloat32 => 32,
            Self::WavPcm24 => 24,
            Self::WavPcm16 => 16,
        }
    }

    pub fn bytes_per_sample(self) -> u64 {
        self.bits_per_sample() as u64 / 8
    }

    /// `fmt ` chunk format tag: 3 for IEEE float, 1 for integer PCM
    pub fn format_tag(self) -> u16 {
        match self {
            Self::WavFloat32 => WAVE_FORMAT_IEEE_FLOAT,
            Self::WavPcm24 | Self::WavPcm16 => WAVE_FORMAT_PCM,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: RecordingFormat,
    pub queue_capacity: usize,
    #[serde(with = "millis")]
    pub enqueue_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            format: RecordingFormat::WavFloat32,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

mod millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = <u64 as serde::Deserialize>::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUESTS & STATS
// ═══════════════════════════════════════════════════════════════════════════════

/// One block handed to the writer thread
#[derive(Debug)]
pub struct WriteRequest {
    pub buffer: AudioBuffer,
    pub frames: usize,
    /// Finalize the file after this block
    pub is_last: bool,
}

/// Result of an enqueue attempt from the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Queued after discarding the oldest pending block
    DroppedOldest,
    /// Lock not acquired in time; the new block was discarded
    TimedOut,
    /// Channel count or buffer validity did not match the stream
    Rejected,
    /// Writer is stopping or has stopped
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WriterStats {
    /// Requests accepted into the queue
    pub queued: u64,
    /// Blocks handed to the encoder successfully
    pub blocks_written: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Blocks evicted by drop-oldest
    pub dropped: u64,
    /// Blocks discarded because the queue lock timed out
    pub timeouts: u64,
    pub rejected: u64,
    pub write_errors: u64,
    /// Rolling average encoder time per block
    pub avg_write_us: f64,
    pub queue_depth: usize,
    /// Encoder hit an error; the file was closed and later blocks are
    /// discarded while the queue drains
    pub failed: bool,
}

impl WriterStats {
    /// Blocks lost for any reason on the producer side
    pub fn total_dropped(&self) -> u64 {
        self.dropped + self.timeouts + self.rejected
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCODER
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical RIFF/WAVE writer: a 16-byte `fmt ` chunk (tag 1 or 3, never
/// WAVE_FORMAT_EXTENSIBLE) and a `data` chunk whose sizes are patched on
/// `finalize`. All fields little-endian.
struct WavEncoder<W: Write + Seek> {
    out: W,
    format: RecordingFormat,
    data_bytes: u64,
    scratch: Vec<u8>,
}

type FileEncoder = WavEncoder<BufWriter<File>>;

impl FileEncoder {
    fn create(path: &Path, config: &WriterConfig) -> FileResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        WavEncoder::new(BufWriter::new(file), config)
    }
}

impl<W: Write + Seek> WavEncoder<W> {
    fn new(mut out: W, config: &WriterConfig) -> FileResult<Self> {
        out.write_all(&wav_header(config, 0))?;
        Ok(Self {
            out,
            format: config.format,
            data_bytes: 0,
            scratch: Vec::new(),
        })
    }

    /// Returns bytes written
    fn write(&mut self, samples: &[f32]) -> FileResult<u64> {
        let bytes = samples.len() as u64 * self.format.bytes_per_sample();
        if self.data_bytes + bytes > MAX_DATA_BYTES {
            return Err(FileError::WriterError("WAV data chunk exceeds 4 GiB".to_string()));
        }

        self.scratch.clear();
        match self.format {
            RecordingFormat::WavFloat32 => {
                for &s in samples {
                    self.scratch.extend_from_slice(&s.to_le_bytes());
                }
            }
            RecordingFormat::WavPcm24 => {
                for &s in samples {
                    let v = (s.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                    self.scratch.extend_from_slice(&v.to_le_bytes()[..3]);
                }
            }
            RecordingFormat::WavPcm16 => {
                for &s in samples {
                    let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
                    self.scratch.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        self.out.write_all(&self.scratch)?;
        self.data_bytes += bytes;
        Ok(bytes)
    }

    /// Pad the data chunk to an even length, patch the RIFF/data sizes and flush
    fn finalize(mut self) -> FileResult<W> {
        if self.data_bytes % 2 == 1 {
            self.out.write_all(&[0])?;
        }
        let padded = self.data_bytes + self.data_bytes % 2;
        let riff_size = (WAV_HEADER_BYTES as u64 - 8 + padded) as u32;

        self.out.seek(SeekFrom::Start(4))?;
        self.out.write_all(&riff_size.to_le_bytes())?;
        self.out.seek(SeekFrom::Start(WAV_HEADER_BYTES as u64 - 4))?;
        self.out.write_all(&(self.data_bytes as u32).to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

fn wav_header(config: &WriterConfig, data_bytes: u32) -> [u8; WAV_HEADER_BYTES] {
    let channels = config.channels;
    let bits = config.format.bits_per_sample();
    let block_align = channels * (bits / 8);
    let byte_rate = config.sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_BYTES];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(WAV_HEADER_BYTES as u32 - 8 + data_bytes).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&config.format.format_tag().to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&config.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_bytes.to_le_bytes());
    header
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

struct Shared {
    queue: Mutex<VecDeque<WriteRequest>>,
    data_available: Condvar,
    capacity: usize,
    channels: usize,
    enqueue_timeout: Duration,
    running: AtomicBool,
    failed: AtomicBool,

    queued: AtomicU64,
    blocks_written: AtomicU64,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    write_errors: AtomicU64,
    /// f64 bits
    avg_write_us: AtomicU64,
}

impl Shared {
    fn new(config: &WriterConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            data_available: Condvar::new(),
            capacity: config.queue_capacity,
            channels: config.channels as usize,
            enqueue_timeout: config.enqueue_timeout,
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            queued: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            avg_write_us: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    fn record_write_time(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1e6;
        let prev = f64::from_bits(self.avg_write_us.load(Ordering::Relaxed));
        let next = if self.blocks_written.load(Ordering::Relaxed) <= 1 {
            sample
        } else {
            prev + 0.1 * (sample - prev)
        };
        self.avg_write_us.store(next.to_bits(), Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASYNC WRITER
// ═══════════════════════════════════════════════════════════════════════════════

/// Recording stream backed by a writer thread
pub struct AsyncWriter {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
    config: WriterConfig,
}

impl AsyncWriter {
    /// Create the file and start the writer thread
    pub fn start<P: AsRef<Path>>(path: P, config: WriterConfig) -> FileResult<Self> {
        let path = path.as_ref().to_path_buf();

        if config.channels == 0 {
            return Err(FileError::InvalidArg("channel count must be non-zero".to_string()));
        }
        if config.sample_rate == 0 {
            return Err(FileError::InvalidArg("sample rate must be non-zero".to_string()));
        }
        if config.queue_capacity == 0 {
            return Err(FileError::InvalidArg("queue capacity must be non-zero".to_string()));
        }

        let encoder = FileEncoder::create(&path, &config)?;

        let shared = Arc::new(Shared::new(&config));

        let thread_shared = Arc::clone(&shared);
        let thread_path = path.clone();
        let thread = spawn_named("orb-io-write", move || {
            let _ = lower_current_thread_priority();
            writer_loop(&thread_shared, encoder, &thread_path);
        })
        .map_err(|e| FileError::WriterError(e.to_string()))?;

        log::info!(
            "Recording started: {} ({} Hz, {} ch, {:?})",
            path.display(),
            config.sample_rate,
            config.channels,
            config.format
        );

        Ok(Self {
            shared,
            thread: Some(thread),
            path,
            config,
        })
    }

    /// RT-safe enqueue of a full buffer
    pub fn queue(&self, buffer: AudioBuffer) -> QueueOutcome {
        let frames = buffer.frames();
        self.queue_request(WriteRequest {
            buffer,
            frames,
            is_last: false,
        })
    }

    /// RT-safe enqueue. Waits at most `enqueue_timeout` for the lock.
    pub fn queue_request(&self, request: WriteRequest) -> QueueOutcome {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return QueueOutcome::Stopped;
        }
        if !request.buffer.is_valid()
            || request.buffer.channels() != shared.channels
            || request.frames > request.buffer.frames()
        {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            return QueueOutcome::Rejected;
        }

        let Some(mut queue) = shared.queue.try_lock_for(shared.enqueue_timeout) else {
            shared.timeouts.fetch_add(1, Ordering::Relaxed);
            return QueueOutcome::TimedOut;
        };

        let mut outcome = QueueOutcome::Queued;
        let mut evicted = None;
        if queue.len() >= shared.capacity {
            evicted = queue.pop_front();
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            outcome = QueueOutcome::DroppedOldest;
        }
        queue.push_back(request);
        shared.queued.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        shared.data_available.notify_one();
        // Returns the evicted buffer to its pool outside the queue lock
        drop(evicted);
        outcome
    }

    /// Signal drain, wait for the writer thread and close the file
    pub fn stop(&mut self) -> WriterStats {
        if let Some(handle) = self.thread.take() {
            self.shared.running.store(false, Ordering::Release);
            self.shared.data_available.notify_all();
            if !join_with_timeout(handle, STOP_TIMEOUT) {
                log::error!("Writer for {} did not finish draining", self.path.display());
            }
            let stats = self.stats();
            log::info!(
                "Recording stopped: {} ({} frames, {} dropped)",
                self.path.display(),
                stats.frames_written,
                stats.total_dropped()
            );
        }
        self.stats()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.running.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn stats(&self) -> WriterStats {
        let s = &self.shared;
        WriterStats {
            queued: s.queued.load(Ordering::Relaxed),
            blocks_written: s.blocks_written.load(Ordering::Relaxed),
            frames_written: s.frames_written.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            write_errors: s.write_errors.load(Ordering::Relaxed),
            avg_write_us: f64::from_bits(s.avg_write_us.load(Ordering::Relaxed)),
            queue_depth: s.queue.try_lock().map(|q| q.len()).unwrap_or(0),
            failed: s.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop<W: Write + Seek>(shared: &Shared, encoder: WavEncoder<W>, path: &Path) {
    let mut encoder = Some(encoder);

    loop {
        let request = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(request) = queue.pop_front() {
                    break Some(request);
                }
                if !shared.running.load(Ordering::Acquire) {
                    break None;
                }
                shared.data_available.wait_for(&mut queue, IDLE_WAIT);
            }
        };

        let Some(request) = request else {
            break;
        };
        let is_last = request.is_last;

        if let Some(enc) = encoder.as_mut() {
            let samples = &request.buffer.as_slice()[..request.frames * shared.channels];
            let started = Instant::now();
            match enc.write(samples) {
                Ok(bytes) => {
                    shared.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                    shared.frames_written.fetch_add(request.frames as u64, Ordering::Relaxed);
                    shared.blocks_written.fetch_add(1, Ordering::Relaxed);
                    shared.record_write_time(started.elapsed());
                }
                Err(e) => {
                    shared.write_errors.fetch_add(1, Ordering::Relaxed);
                    shared.failed.store(true, Ordering::Release);
                    log::error!("Recording to {} failed: {}", path.display(), e);
                    // Close out what was written; the rest of the queue only drains
                    if let Some(enc) = encoder.take()
                        && let Err(e) = enc.finalize()
                    {
                        log::warn!("Failed to finalize {} after error: {}", path.display(), e);
                    }
                }
            }
        }
        // Buffer returns to its pool here
        drop(request);

        if is_last {
            shared.running.store(false, Ordering::Release);
        }
    }

    if let Some(enc) = encoder.take()
        && let Err(e) = enc.finalize()
    {
        shared.write_errors.fetch_add(1, Ordering::Relaxed);
        shared.failed.store(true, Ordering::Release);
        log::error!("Failed to finalize {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::BufferPool;
    use std::io::Cursor;

    /// In-memory sink that fails exactly its `fail_on`-th write call
    struct FlakyWriter {
        inner: Cursor<Vec<u8>>,
        writes: usize,
        fail_on: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            if self.writes == self.fail_on {
                return Err(std::io::Error::other("disk full"));
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FlakyWriter {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn config(channels: u16) -> WriterConfig {
        WriterConfig {
            sample_rate: 44100,
            channels,
            ..Default::default()
        }
    }

    fn block(pool: &BufferPool, frames: usize, channels: usize, value: f32) -> AudioBuffer {
        let mut buffer = pool.acquire(frames, channels);
        buffer.as_mut_slice().fill(value);
        buffer
    }

    #[test]
    fn test_writes_blocks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.wav");
        let pool = BufferPool::new(8);

        let mut writer = AsyncWriter::start(&path, config(2)).unwrap();
        for i in 0..20 {
            assert_eq!(writer.queue(block(&pool, 64, 2, i as f32)), QueueOutcome::Queued);
        }
        let stats = writer.stop();
        assert_eq!(stats.blocks_written, 20);
        assert_eq!(stats.frames_written, 20 * 64);
        assert_eq!(stats.bytes_written, 20 * 64 * 2 * 4);
        assert!(!stats.failed);

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_format, hound::SampleFormat::Float);
        assert_eq!(spec.bits_per_sample, 32);
        assert_eq!(reader.duration(), 20 * 64);

        let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
        for (i, chunk) in samples.chunks(128).enumerate() {
            assert!(chunk.iter().all(|&s| s == i as f32));
        }
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(2);
        let mut writer = AsyncWriter::start(dir.path().join("m.wav"), config(2)).unwrap();

        assert_eq!(writer.queue(block(&pool, 32, 1, 0.0)), QueueOutcome::Rejected);
        assert_eq!(writer.queue(AudioBuffer::invalid()), QueueOutcome::Rejected);
        let stats = writer.stop();
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.blocks_written, 0);
    }

    #[test]
    fn test_queue_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(2);
        let mut writer = AsyncWriter::start(dir.path().join("s.wav"), config(1)).unwrap();
        writer.stop();
        assert!(!writer.is_running());
        assert_eq!(writer.queue(block(&pool, 16, 1, 0.0)), QueueOutcome::Stopped);
    }

    #[test]
    fn test_last_block_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last.wav");
        let pool = BufferPool::new(2);
        let mut writer = AsyncWriter::start(&path, config(1)).unwrap();

        writer.queue(block(&pool, 10, 1, 0.25));
        writer.queue_request(WriteRequest {
            buffer: block(&pool, 10, 1, 0.5),
            frames: 4,
            is_last: true,
        });
        let stats = writer.stop();
        assert_eq!(stats.frames_written, 14);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 14);
    }

    #[test]
    fn test_pcm16_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm.wav");
        let pool = BufferPool::new(2);
        let mut writer = AsyncWriter::start(
            &path,
            WriterConfig {
                format: RecordingFormat::WavPcm16,
                ..config(1)
            },
        )
        .unwrap();
        writer.queue(block(&pool, 8, 1, 2.0));
        let stats = writer.stop();
        assert_eq!(stats.bytes_written, 16);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let first = reader.samples::<i16>().next().unwrap().unwrap();
        assert_eq!(first, 32_767);
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(8);
        let mut writer = AsyncWriter::start(dir.path().join("p.wav"), config(2)).unwrap();
        for _ in 0..4 {
            writer.queue(block(&pool, 128, 2, 0.1));
        }
        writer.stop();
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = AsyncWriter::start(dir.path().join("x.wav"), config(0)).err().unwrap();
        assert!(matches!(err, FileError::InvalidArg(_)));
    }

    #[test]
    fn test_encoder_error_discards_later_blocks() {
        let pool = BufferPool::new(4);
        let cfg = config(2);
        let shared = Shared::new(&cfg);
        {
            let mut queue = shared.queue.lock();
            for i in 0..3 {
                queue.push_back(WriteRequest {
                    buffer: block(&pool, 64, 2, i as f32),
                    frames: 64,
                    is_last: false,
                });
            }
        }
        shared.running.store(false, Ordering::Release);

        // Write 1 is the header, write 2 the first block, write 3 fails
        let out = FlakyWriter {
            inner: Cursor::new(Vec::new()),
            writes: 0,
            fail_on: 3,
        };
        let encoder = WavEncoder::new(out, &cfg).unwrap();
        writer_loop(&shared, encoder, Path::new("flaky.wav"));

        // The third block would have succeeded on the sink; it must not be counted
        assert_eq!(shared.blocks_written.load(Ordering::Relaxed), 1);
        assert_eq!(shared.frames_written.load(Ordering::Relaxed), 64);
        assert_eq!(shared.write_errors.load(Ordering::Relaxed), 1);
        assert!(shared.failed.load(Ordering::Relaxed));
        assert!(shared.queue.lock().is_empty());
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_header_sizes_patched_on_finalize() {
        let cfg = WriterConfig {
            format: RecordingFormat::WavPcm24,
            ..config(1)
        };
        let mut encoder = WavEncoder::new(Cursor::new(Vec::new()), &cfg).unwrap();
        assert_eq!(encoder.write(&[0.5, -0.5, 1.0]).unwrap(), 9);
        let bytes = encoder.finalize().unwrap().into_inner();

        // 9 data bytes plus one pad byte
        assert_eq!(bytes.len(), 44 + 10);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 36 + 10);
        assert_eq!(u16::from_le_bytes(bytes[20..22].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(bytes[34..36].try_into().unwrap()), 24);
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 9);
        assert_eq!(&bytes[44..47], &4_194_303i32.to_le_bytes()[..3]);
    }
}
