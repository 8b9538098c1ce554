//! Null device sink
//!
//! Stands in for an audio device: calls `Engine::render` once per block on
//! a dedicated thread, optionally paced to wall-clock time, and throws the
//! output away. The engine's recorder captures it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use orb_core::thread::{set_realtime_priority, spawn_named};
use orb_engine::Engine;

/// Summary of one sink run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkReport {
    pub frames: u64,
    pub blocks: u64,
    /// Blocks whose render took longer than their real-time budget
    pub late_blocks: u64,
    pub elapsed: Duration,
}

pub struct NullSink {
    block_frames: usize,
    channels: usize,
    sample_rate: u32,
    /// Sleep out the remainder of each block's period
    paced: bool,
}

impl NullSink {
    pub fn for_engine(engine: &Engine, paced: bool) -> Self {
        Self {
            block_frames: engine.buffer_frames(),
            channels: engine.channels(),
            sample_rate: engine.sample_rate(),
            paced,
        }
    }

    /// Render `total_frames` on an `orb-audio` thread. The report is sent
    /// on `done` when the run finishes or `cancel` is raised.
    pub fn spawn(
        self,
        engine: Arc<Engine>,
        total_frames: u64,
        cancel: Arc<AtomicBool>,
        done: Sender<SinkReport>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let handle = spawn_named("orb-audio", move || {
            set_realtime_priority();
            let report = self.run(&engine, total_frames, &cancel);
            let _ = done.send(report);
        })?;
        Ok(handle)
    }

    fn run(&self, engine: &Engine, total_frames: u64, cancel: &AtomicBool) -> SinkReport {
        let period = Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate as f64);
        let mut buffer = vec![0.0f32; self.block_frames * self.channels];
        let started = Instant::now();
        let mut next_deadline = started + period;
        let mut report = SinkReport {
            frames: 0,
            blocks: 0,
            late_blocks: 0,
            elapsed: Duration::ZERO,
        };

        while report.frames < total_frames && !cancel.load(Ordering::Acquire) {
            let frames = (total_frames - report.frames).min(self.block_frames as u64) as usize;
            let block_start = Instant::now();
            engine.render(&mut buffer, frames);
            if block_start.elapsed() > period {
                report.late_blocks += 1;
            }

            report.frames += frames as u64;
            report.blocks += 1;

            if self.paced {
                let now = Instant::now();
                if next_deadline > now {
                    std::thread::sleep(next_deadline - now);
                }
                next_deadline += period;
            }
        }

        report.elapsed = started.elapsed();
        report
    }
}
