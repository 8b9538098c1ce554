//! Engine statistics
//!
//! The audio thread only increments counters. `EngineStats` is the
//! snapshot handed to hosts.

use std::sync::atomic::{AtomicU64, Ordering};

use orb_core::MemoryPressure;
use orb_file::WriterStats;
use serde::Serialize;

use crate::meter::AtomicF32;

/// Smoothing of the CPU load estimate per block
const CPU_LOAD_SMOOTHING: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineStats {
    /// Render time over block time, smoothed (1.0 = deadline)
    pub cpu_load: f32,
    pub underruns: u64,
    /// Recording blocks lost to overflow, lock timeouts or rejection
    pub write_drops: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    /// Render calls that found the track registry locked
    pub contention: u64,
    pub blocks_rendered: u64,
    pub rt_log_dropped: u64,
    /// Estimated spatializer cost, percent of one core
    pub spatial_load: f32,
    pub latency_samples: usize,
    /// Writer figures while recording, or of the last recording
    pub recording: Option<WriterStats>,
    pub memory_pressure: MemoryPressure,
}

/// Counters written by the audio thread
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub cpu_load: AtomicF32,
    pub underruns: AtomicU64,
    pub contention: AtomicU64,
    pub blocks_rendered: AtomicU64,
    pub spatial_load: AtomicF32,
    pub latency_samples: AtomicU64,
}

impl EngineCounters {
    #[inline]
    pub fn add_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_contention(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_blocks(&self, blocks: u64) {
        self.blocks_rendered.fetch_add(blocks, Ordering::Relaxed);
    }

    /// Fold one render call's time/budget ratio into the estimate
    #[inline]
    pub fn record_load(&self, ratio: f32) {
        let previous = self.cpu_load.load();
        self.cpu_load
            .store(previous + (ratio - previous) * CPU_LOAD_SMOOTHING);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn contention(&self) -> u64 {
        self.contention.load(Ordering::Relaxed)
    }

    pub fn blocks_rendered(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Relaxed)
    }

    pub fn latency_samples(&self) -> usize {
        self.latency_samples.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_converges() {
        let counters = EngineCounters::default();
        for _ in 0..200 {
            counters.record_load(0.4);
        }
        assert!((counters.cpu_load.load() - 0.4).abs() < 1e-3);
    }

    #[test]
    fn test_counters() {
        let counters = EngineCounters::default();
        counters.add_underrun();
        counters.add_underrun();
        counters.add_contention();
        counters.add_blocks(3);
        assert_eq!(counters.underruns(), 2);
        assert_eq!(counters.contention(), 1);
        assert_eq!(counters.blocks_rendered(), 3);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = EngineStats {
            cpu_load: 0.25,
            underruns: 1,
            write_drops: 0,
            pool_hits: 10,
            pool_misses: 2,
            contention: 0,
            blocks_rendered: 100,
            rt_log_dropped: 0,
            spatial_load: 0.1,
            latency_samples: 0,
            recording: None,
            memory_pressure: MemoryPressure::Normal,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"blocks_rendered\":100"));
        assert!(json.contains("\"memory_pressure\":\"Normal\""));
    }
}
