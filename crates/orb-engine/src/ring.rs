//! SPSC ring of interleaved frames
//!
//! Producer: the streamer's IO thread. Consumer: the audio callback.
//!
//! Positions are monotonically increasing frame counters; the slot index
//! is `position % capacity`. One slot always stays empty, so
//! `available + free == capacity - 1`. Each position has exactly one
//! writer: `write_pos` belongs to the producer, `read_pos` to the consumer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use orb_core::Sample;

pub struct StreamRing {
    /// Interleaved audio data [capacity_frames * channels]
    data: Box<[UnsafeCell<Sample>]>,
    capacity_frames: usize,
    channels: usize,
    /// Frames ever written (producer only)
    write_pos: AtomicU64,
    /// Frames ever consumed (consumer only)
    read_pos: AtomicU64,
}

// SAFETY: slots in [read_pos, write_pos) are only read by the consumer and
// slots outside it only written by the producer. The release store on the
// owning index publishes each side's accesses to the other.
unsafe impl Send for StreamRing {}
unsafe impl Sync for StreamRing {}

impl StreamRing {
    /// `capacity_frames` includes the slot that is never filled
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let capacity_frames = capacity_frames.max(2);
        let channels = channels.max(1);
        let data = (0..capacity_frames * channels)
            .map(|_| UnsafeCell::new(0.0))
            .collect();
        Self {
            data,
            capacity_frames,
            channels,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn footprint_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<Sample>()
    }

    /// Frames ready for the consumer
    #[inline]
    pub fn available_read(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.saturating_sub(r) as usize
    }

    /// Frames the producer may write
    #[inline]
    pub fn available_write(&self) -> usize {
        (self.capacity_frames - 1).saturating_sub(self.available_read())
    }

    /// Producer position, used as the flush marker after a seek
    #[inline]
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_position(&self) -> u64 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Fill level 0..1
    pub fn fill_level(&self) -> f32 {
        self.available_read() as f32 / (self.capacity_frames - 1) as f32
    }

    /// Consumer: copy up to `frames` frames into `output`, zero-filling
    /// whatever could not be read. Returns frames read.
    #[inline]
    pub fn read(&self, output: &mut [Sample], frames: usize) -> usize {
        let ch = self.channels;
        let frames = frames.min(output.len() / ch);
        let to_read = frames.min(self.available_read());

        let r = self.read_pos.load(Ordering::Relaxed);
        let start = (r % self.capacity_frames as u64) as usize;
        let first = to_read.min(self.capacity_frames - start);

        self.copy_out(start, &mut output[..first * ch]);
        self.copy_out(0, &mut output[first * ch..to_read * ch]);
        output[to_read * ch..frames * ch].fill(0.0);

        if to_read > 0 {
            self.read_pos.store(r + to_read as u64, Ordering::Release);
        }
        to_read
    }

    /// Consumer: drop frames without copying. Returns frames skipped.
    pub fn skip(&self, frames: usize) -> usize {
        let to_skip = frames.min(self.available_read());
        if to_skip > 0 {
            let r = self.read_pos.load(Ordering::Relaxed);
            self.read_pos.store(r + to_skip as u64, Ordering::Release);
        }
        to_skip
    }

    /// Consumer: discard everything written before producer position `marker`
    pub fn discard_until(&self, marker: u64) -> usize {
        let r = self.read_pos.load(Ordering::Relaxed);
        if marker <= r {
            return 0;
        }
        let w = self.write_pos.load(Ordering::Acquire);
        self.skip(marker.min(w).saturating_sub(r) as usize)
    }

    /// Producer: copy up to `frames` frames from `input`. Returns frames written.
    #[inline]
    pub fn write(&self, input: &[Sample], frames: usize) -> usize {
        let ch = self.channels;
        let frames = frames.min(input.len() / ch);
        let to_write = frames.min(self.available_write());
        if to_write == 0 {
            return 0;
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        let start = (w % self.capacity_frames as u64) as usize;
        let first = to_write.min(self.capacity_frames - start);

        self.copy_in(start, &input[..first * ch]);
        self.copy_in(0, &input[first * ch..to_write * ch]);

        self.write_pos.store(w + to_write as u64, Ordering::Release);
        to_write
    }

    fn copy_out(&self, frame: usize, dst: &mut [Sample]) {
        let offset = frame * self.channels;
        for (d, cell) in dst.iter_mut().zip(&self.data[offset..]) {
            // SAFETY: slot lies in the readable region owned by the consumer
            *d = unsafe { *cell.get() };
        }
    }

    fn copy_in(&self, frame: usize, src: &[Sample]) {
        let offset = frame * self.channels;
        for (s, cell) in src.iter().zip(&self.data[offset..]) {
            // SAFETY: slot lies in the free region owned by the producer
            unsafe { *cell.get() = *s };
        }
    }
}

impl std::fmt::Debug for StreamRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRing")
            .field("capacity_frames", &self.capacity_frames)
            .field("channels", &self.channels)
            .field("available", &self.available_read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ring_buffer_basic() {
        let rb = StreamRing::new(1024, 2);

        assert_eq!(rb.available_read(), 0);
        assert_eq!(rb.available_write(), 1023);

        let input = vec![1.0f32; 256 * 2];
        assert_eq!(rb.write(&input, 256), 256);
        assert_eq!(rb.available_read(), 256);
        assert_eq!(rb.available_read() + rb.available_write(), 1023);

        let mut output = vec![0.0f32; 256 * 2];
        assert_eq!(rb.read(&mut output, 256), 256);
        assert_eq!(rb.available_read(), 0);
        assert!(output.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_ring_buffer_wrap() {
        let rb = StreamRing::new(64, 2);

        rb.write(&vec![1.0f32; 32 * 2], 32);
        let mut output = vec![0.0f32; 16 * 2];
        rb.read(&mut output, 16);

        // Crosses the end of storage
        let input: Vec<f32> = (0..48 * 2).map(|i| i as f32).collect();
        assert_eq!(rb.write(&input, 48), 47);
        assert_eq!(rb.available_read(), 63);
        assert_eq!(rb.available_write(), 0);

        let mut all = vec![0.0f32; 63 * 2];
        assert_eq!(rb.read(&mut all, 63), 63);
        assert!(all[..16 * 2].iter().all(|&s| s == 1.0));
        assert_eq!(&all[16 * 2..], &input[..47 * 2]);
    }

    #[test]
    fn test_underflow_zero_fills() {
        let rb = StreamRing::new(16, 1);
        rb.write(&[0.5, 0.5, 0.5], 3);
        let mut output = vec![9.0f32; 8];
        assert_eq!(rb.read(&mut output, 8), 3);
        assert_eq!(output, [0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_discard_until_marker() {
        let rb = StreamRing::new(32, 1);
        rb.write(&[1.0; 10], 10);
        let marker = rb.write_position();
        rb.write(&[2.0; 4], 4);

        assert_eq!(rb.discard_until(marker), 10);
        // Already past the marker: nothing more to drop
        assert_eq!(rb.discard_until(marker), 0);

        let mut output = [0.0f32; 4];
        rb.read(&mut output, 4);
        assert_eq!(output, [2.0; 4]);
    }

    #[test]
    fn test_accounting_invariant_under_churn() {
        let rb = StreamRing::new(37, 3);
        let block = vec![0.25f32; 11 * 3];
        let mut out = vec![0.0f32; 7 * 3];
        for i in 0..200 {
            if i % 3 == 0 {
                rb.read(&mut out, 7);
            } else {
                rb.write(&block, 11);
            }
            let avail = rb.available_read();
            assert!(avail <= rb.capacity_frames() - 1);
            assert_eq!(avail + rb.available_write(), rb.capacity_frames() - 1);
        }
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        let rb = Arc::new(StreamRing::new(257, 1));
        let producer = Arc::clone(&rb);
        const TOTAL: usize = 100_000;

        let handle = std::thread::spawn(move || {
            let mut next = 0usize;
            let mut chunk = [0.0f32; 64];
            while next < TOTAL {
                let n = 64.min(TOTAL - next);
                for (i, s) in chunk[..n].iter_mut().enumerate() {
                    *s = (next + i) as f32;
                }
                next += producer.write(&chunk[..n], n);
                std::thread::yield_now();
            }
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 50];
        while expected < TOTAL {
            let n = rb.read(&mut out, 50);
            for &s in &out[..n] {
                assert_eq!(s, expected as f32);
                expected += 1;
            }
        }
        handle.join().unwrap();
    }
}
