//! Pooled audio buffers
//!
//! `BufferPool` keeps free lists keyed by exact `(frames, channels)`.
//! `AudioBuffer` is the only handle to pooled storage: it is move-only and
//! hands its storage back to the originating pool when dropped.
//!
//! `acquire` never fails. On a miss it allocates; if that allocation fails
//! the returned buffer is invalid and callers treat it as silence.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::Sample;

/// Default number of free buffers retained per size class
pub const DEFAULT_CLASS_CAPACITY: usize = 8;

/// Free buffers per class that `cleanup_old` never evicts
pub const DEFAULT_RETENTION: usize = 2;

static GLOBAL_POOL: OnceLock<BufferPool> = OnceLock::new();

// ═══════════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of pool accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Buffers owned by the pool (free + handed out)
    pub total: usize,
    /// Buffers sitting in free lists
    pub available: usize,
    /// Buffers currently handed out
    pub in_use: usize,
    /// Fresh allocations performed
    pub alloc_count: u64,
    /// Acquires served from a free list
    pub hit_count: u64,
    /// Acquires that had to allocate
    pub miss_count: u64,
    /// Successful acquires
    pub acquired: u64,
    /// Buffers handed back by `AudioBuffer` drops
    pub returned: u64,
}

struct FreeEntry {
    data: Vec<Sample>,
    released_at: Instant,
}

struct PoolInner {
    classes: Mutex<HashMap<(usize, usize), Vec<FreeEntry>>>,
    class_capacity: usize,
    retention: usize,
    total: AtomicUsize,
    available: AtomicUsize,
    in_use: AtomicUsize,
    alloc_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    acquired: AtomicU64,
    returned: AtomicU64,
}

impl PoolInner {
    fn release(&self, data: Vec<Sample>, frames: usize, channels: usize) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        let mut classes = self.classes.lock();
        let free = classes
            .entry((frames, channels))
            .or_insert_with(|| Vec::with_capacity(self.class_capacity));

        if free.len() < self.class_capacity {
            free.push(FreeEntry {
                data,
                released_at: Instant::now(),
            });
            self.available.fetch_add(1, Ordering::Relaxed);
        } else {
            // Class is full, storage is freed after the lock is released
            self.total.fetch_sub(1, Ordering::Relaxed);
            drop(classes);
            drop(data);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUFFER POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe pool of interleaved float buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(class_capacity: usize) -> Self {
        Self::with_retention(class_capacity, DEFAULT_RETENTION)
    }

    pub fn with_retention(class_capacity: usize, retention: usize) -> Self {
        let class_capacity = class_capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                classes: Mutex::new(HashMap::new()),
                class_capacity,
                retention: retention.min(class_capacity),
                total: AtomicUsize::new(0),
                available: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                alloc_count: AtomicU64::new(0),
                hit_count: AtomicU64::new(0),
                miss_count: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Process-wide pool, created on first use
    pub fn global() -> &'static BufferPool {
        GLOBAL_POOL.get_or_init(|| BufferPool::new(DEFAULT_CLASS_CAPACITY))
    }

    /// Initialize the process-wide pool explicitly.
    ///
    /// Returns false if it already existed (the existing pool is kept).
    pub fn init_global(class_capacity: usize) -> bool {
        let mut created = false;
        GLOBAL_POOL.get_or_init(|| {
            created = true;
            BufferPool::new(class_capacity)
        });
        if created {
            log::debug!("Global buffer pool initialized ({} per class)", class_capacity);
        }
        created
    }

    /// Release every free buffer held by the process-wide pool.
    ///
    /// Buffers still handed out return normally when dropped.
    pub fn shutdown_global() {
        if let Some(pool) = GLOBAL_POOL.get() {
            let freed = pool.clear_free();
            log::debug!("Global buffer pool shut down, {} free buffers released", freed);
        }
    }

    /// Take a buffer of exactly `frames * channels` samples, zeroed.
    ///
    /// Never blocks beyond the free-list lock and never fails; an allocation
    /// failure yields an invalid buffer.
    pub fn acquire(&self, frames: usize, channels: usize) -> AudioBuffer {
        let inner = &self.inner;
        let recycled = {
            let mut classes = inner.classes.lock();
            match classes.get_mut(&(frames, channels)) {
                Some(free) => free.pop().map(|entry| entry.data),
                None => {
                    classes.insert((frames, channels), Vec::with_capacity(inner.class_capacity));
                    None
                }
            }
        };

        let data = match recycled {
            Some(mut data) => {
                inner.hit_count.fetch_add(1, Ordering::Relaxed);
                inner.available.fetch_sub(1, Ordering::Relaxed);
                data.fill(0.0);
                data
            }
            None => {
                inner.miss_count.fetch_add(1, Ordering::Relaxed);
                match allocate(frames * channels) {
                    Some(data) => {
                        inner.alloc_count.fetch_add(1, Ordering::Relaxed);
                        inner.total.fetch_add(1, Ordering::Relaxed);
                        data
                    }
                    None => return AudioBuffer::invalid(),
                }
            }
        };

        inner.acquired.fetch_add(1, Ordering::Relaxed);
        inner.in_use.fetch_add(1, Ordering::Relaxed);

        AudioBuffer {
            data,
            frames,
            channels,
            pool: Some(Arc::clone(inner)),
        }
    }

    /// Fill the free list for a size class ahead of real-time use
    pub fn prewarm(&self, frames: usize, channels: usize, count: usize) {
        let held: Vec<AudioBuffer> = (0..count.min(self.inner.class_capacity))
            .map(|_| self.acquire(frames, channels))
            .collect();
        drop(held);
    }

    /// Evict free buffers idle for longer than `max_age`, keeping the
    /// retention watermark in every class. Returns the number evicted.
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let retention = self.inner.retention;
        let mut evicted = Vec::new();

        {
            let mut classes = self.inner.classes.lock();
            for free in classes.values_mut() {
                // Oldest entries sit at the front
                while free.len() > retention {
                    match free.first() {
                        Some(entry) if now.duration_since(entry.released_at) > max_age => {
                            evicted.push(free.remove(0));
                        }
                        _ => break,
                    }
                }
            }
        }

        let count = evicted.len();
        self.inner.available.fetch_sub(count, Ordering::Relaxed);
        self.inner.total.fetch_sub(count, Ordering::Relaxed);
        if count > 0 {
            log::debug!("Buffer pool evicted {} idle buffers", count);
        }
        count
    }

    /// Drop every free buffer. Returns the number released.
    pub fn clear_free(&self) -> usize {
        let drained: Vec<FreeEntry> = {
            let mut classes = self.inner.classes.lock();
            classes.values_mut().flat_map(|free| free.drain(..)).collect()
        };
        let count = drained.len();
        self.inner.available.fetch_sub(count, Ordering::Relaxed);
        self.inner.total.fetch_sub(count, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            total: inner.total.load(Ordering::Relaxed),
            available: inner.available.load(Ordering::Relaxed),
            in_use: inner.in_use.load(Ordering::Relaxed),
            alloc_count: inner.alloc_count.load(Ordering::Relaxed),
            hit_count: inner.hit_count.load(Ordering::Relaxed),
            miss_count: inner.miss_count.load(Ordering::Relaxed),
            acquired: inner.acquired.load(Ordering::Relaxed),
            returned: inner.returned.load(Ordering::Relaxed),
        }
    }

    /// Approximate bytes held by the pool
    pub fn footprint_bytes(&self) -> usize {
        let classes = self.inner.classes.lock();
        classes
            .values()
            .flat_map(|free| free.iter())
            .map(|entry| entry.data.capacity() * std::mem::size_of::<Sample>())
            .sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_CLASS_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("class_capacity", &self.inner.class_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Allocate zeroed storage rounded up to a power-of-two capacity
fn allocate(len: usize) -> Option<Vec<Sample>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len.next_power_of_two()).ok()?;
    data.resize(len, 0.0);
    Some(data)
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// Move-only interleaved buffer borrowed from a `BufferPool`.
///
/// A valid buffer always has an originating pool; an invalid one has
/// neither storage nor pool.
pub struct AudioBuffer {
    data: Vec<Sample>,
    frames: usize,
    channels: usize,
    pool: Option<Arc<PoolInner>>,
}

impl AudioBuffer {
    /// Empty handle that owns nothing
    pub const fn invalid() -> Self {
        Self {
            data: Vec::new(),
            frames: 0,
            channels: 0,
            pool: None,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.pool.is_some()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn as_slice(&self) -> &[Sample] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Sample] {
        &mut self.data
    }

    /// Zero the contents
    #[inline]
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Move the contents out, leaving this handle invalid
    pub fn take(&mut self) -> AudioBuffer {
        std::mem::take(self)
    }
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Deref for AudioBuffer {
    type Target = [Sample];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for AudioBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for AudioBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data), self.frames, self.channels);
        }
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("frames", &self.frames)
            .field("channels", &self.channels)
            .field("valid", &self.is_valid())
            .finish()
    }
}
