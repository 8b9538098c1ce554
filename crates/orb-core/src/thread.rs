//! Thread helpers
//!
//! - Priority: raise the host's render thread, lower the IO threads
//! - Bounded join for shutting down background workers
//!
//! Priority changes are best effort. Failures are logged and never fatal.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{OrbError, OrbResult};

/// Outcome of a priority change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Success,
    /// The OS refused (missing privileges)
    Failed,
    Unsupported,
}

/// Spawn a named thread, mapping spawn failure to `OrbError`
pub fn spawn_named<F>(name: &str, f: F) -> OrbResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| {
            log::error!("Failed to spawn thread {}: {}", name, e);
            OrbError::from(e)
        })
}

/// Wait up to `timeout` for a thread to finish.
///
/// Returns false if it was still running; the handle is then dropped and
/// the thread detached.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            log::warn!("Thread {} did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }

    if handle.join().is_err() {
        log::error!("Worker thread panicked during shutdown");
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRIORITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Elevate the calling thread for real-time rendering
pub fn set_realtime_priority() -> PriorityResult {
    let result = platform_set_realtime();
    match result {
        PriorityResult::Success => log::info!("Render thread elevated to real-time priority"),
        PriorityResult::Failed => log::warn!("Failed to set real-time thread priority (non-fatal)"),
        PriorityResult::Unsupported => {
            log::debug!("Real-time priority not supported on this platform")
        }
    }
    result
}

/// Drop the calling thread below normal priority (disk and encoder threads)
pub fn lower_current_thread_priority() -> PriorityResult {
    let result = platform_lower_priority();
    if result == PriorityResult::Failed {
        log::debug!("Could not lower priority of {:?}", thread::current().name());
    }
    result
}

#[cfg(target_os = "linux")]
fn platform_set_realtime() -> PriorityResult {
    use libc::{SCHED_FIFO, SCHED_RR, pthread_self, pthread_setschedparam, sched_param};

    // Priority 80 leaves room for kernel threads
    let param = sched_param { sched_priority: 80 };
    // SAFETY: pthread_self is always valid for the calling thread
    let result = unsafe { pthread_setschedparam(pthread_self(), SCHED_FIFO, &param) };
    if result == 0 {
        return PriorityResult::Success;
    }

    log::debug!("SCHED_FIFO failed (need CAP_SYS_NICE), trying SCHED_RR");

    let param = sched_param { sched_priority: 70 };
    // SAFETY: as above
    let result = unsafe { pthread_setschedparam(pthread_self(), SCHED_RR, &param) };
    if result == 0 {
        PriorityResult::Success
    } else {
        PriorityResult::Failed
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_set_realtime() -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(target_os = "linux")]
fn platform_lower_priority() -> PriorityResult {
    // On Linux, PRIO_PROCESS with who=0 applies to the calling thread only
    // SAFETY: setpriority has no memory-safety preconditions
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 10) };
    if result == 0 {
        PriorityResult::Success
    } else {
        PriorityResult::Failed
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_lower_priority() -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_join_finished_thread() {
        let handle = spawn_named("orb-test-quick", || {}).unwrap();
        assert!(join_with_timeout(handle, Duration::from_millis(500)));
    }

    #[test]
    fn test_join_times_out_and_detaches() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let handle = spawn_named("orb-test-stuck", move || {
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        assert!(!join_with_timeout(handle, Duration::from_millis(20)));
        release.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_lower_priority_never_panics() {
        let handle = spawn_named("orb-test-nice", || {
            let _ = lower_current_thread_priority();
        })
        .unwrap();
        assert!(join_with_timeout(handle, Duration::from_secs(1)));
    }
}
