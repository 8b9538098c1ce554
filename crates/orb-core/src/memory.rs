//! Process-wide memory accounting
//!
//! Components report their footprint by name. Pressure is classified from
//! the OS view of used/total physical memory, or from the registered total
//! against an explicit budget when one is set.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimum spacing between OS queries
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

static GLOBAL_MONITOR: OnceLock<MemoryMonitor> = OnceLock::new();

/// Memory pressure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum MemoryPressure {
    /// Below 70% used
    Normal = 0,
    /// 70% to 90%
    Warning = 1,
    /// 90% to 95%
    Critical = 2,
    /// 95% and above
    Emergency = 3,
}

impl MemoryPressure {
    /// Classify a used/total ratio
    pub fn from_usage(ratio: f64) -> Self {
        if ratio >= 0.95 {
            Self::Emergency
        } else if ratio >= 0.90 {
            Self::Critical
        } else if ratio >= 0.70 {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl From<u8> for MemoryPressure {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Warning,
            2 => Self::Critical,
            3 => Self::Emergency,
            _ => Self::Normal,
        }
    }
}

/// Physical memory as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl SystemMemory {
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64
    }

    /// Current OS figures, if the platform exposes them
    #[cfg(target_os = "linux")]
    pub fn query() -> Option<Self> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        Self::parse_meminfo(&meminfo)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn query() -> Option<Self> {
        // SAFETY: sysconf has no preconditions
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages <= 0 || page_size <= 0 {
            return None;
        }
        // No portable free-page count here, so only the total is known
        let total_bytes = pages as u64 * page_size as u64;
        Some(Self {
            total_bytes,
            available_bytes: total_bytes,
        })
    }

    #[cfg(not(unix))]
    pub fn query() -> Option<Self> {
        None
    }

    /// Parse the `MemTotal` and `MemAvailable` lines of `/proc/meminfo`
    pub fn parse_meminfo(text: &str) -> Option<Self> {
        let mut total = None;
        let mut available = None;

        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let key = parts.next();
            let kib = parts.next().and_then(|v| v.parse::<u64>().ok());
            match (key, kib) {
                (Some("MemTotal:"), Some(v)) => total = Some(v * 1024),
                (Some("MemAvailable:"), Some(v)) => available = Some(v * 1024),
                _ => {}
            }
        }

        Some(Self {
            total_bytes: total?,
            available_bytes: available?,
        })
    }
}

/// Registry of component footprints plus pressure classification
pub struct MemoryMonitor {
    components: Mutex<HashMap<String, usize>>,
    pressure: AtomicU8,
    /// Registered-bytes budget; 0 means use the OS figures
    budget: AtomicU64,
    last_refresh: Mutex<Option<Instant>>,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            pressure: AtomicU8::new(MemoryPressure::Normal as u8),
            budget: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
        }
    }

    /// Process-wide monitor, created on first use
    pub fn global() -> &'static MemoryMonitor {
        GLOBAL_MONITOR.get_or_init(MemoryMonitor::new)
    }

    /// Create the process-wide monitor and take a first reading
    pub fn init() -> &'static MemoryMonitor {
        let monitor = Self::global();
        monitor.refresh();
        monitor
    }

    /// Forget every registration and return to `Normal`
    pub fn shutdown() {
        if let Some(monitor) = GLOBAL_MONITOR.get() {
            monitor.components.lock().clear();
            monitor.pressure.store(MemoryPressure::Normal as u8, Ordering::Release);
            *monitor.last_refresh.lock() = None;
        }
    }

    /// Record a component's footprint, replacing any previous figure
    pub fn register(&self, name: &str, bytes: usize) {
        self.components.lock().insert(name.to_string(), bytes);
        log::debug!("Memory: {} registered ({} bytes)", name, bytes);
        self.refresh_if_due();
    }

    pub fn update(&self, name: &str, bytes: usize) {
        {
            let mut components = self.components.lock();
            match components.get_mut(name) {
                Some(entry) => *entry = bytes,
                None => {
                    components.insert(name.to_string(), bytes);
                }
            }
        }
        self.refresh_if_due();
    }

    pub fn unregister(&self, name: &str) -> Option<usize> {
        let removed = self.components.lock().remove(name);
        if removed.is_some() {
            log::debug!("Memory: {} unregistered", name);
        }
        removed
    }

    pub fn component_bytes(&self, name: &str) -> Option<usize> {
        self.components.lock().get(name).copied()
    }

    pub fn total_registered(&self) -> usize {
        self.components.lock().values().sum()
    }

    /// Classify against registered bytes instead of the OS figures
    pub fn set_budget(&self, bytes: Option<u64>) {
        self.budget.store(bytes.unwrap_or(0), Ordering::Relaxed);
        self.refresh();
    }

    /// Re-classify now, regardless of the rate limit
    pub fn refresh(&self) -> MemoryPressure {
        let budget = self.budget.load(Ordering::Relaxed);
        let ratio = if budget > 0 {
            Some(self.total_registered() as f64 / budget as f64)
        } else {
            SystemMemory::query().map(|mem| mem.used_ratio())
        };

        *self.last_refresh.lock() = Some(Instant::now());

        let Some(ratio) = ratio else {
            return self.pressure();
        };

        let next = MemoryPressure::from_usage(ratio);
        let prev = MemoryPressure::from(self.pressure.swap(next as u8, Ordering::AcqRel));
        if next != prev {
            if next > prev {
                log::warn!("Memory pressure {:?} -> {:?} ({:.1}% used)", prev, next, ratio * 100.0);
            } else {
                log::info!("Memory pressure {:?} -> {:?} ({:.1}% used)", prev, next, ratio * 100.0);
            }
        }
        next
    }

    /// Re-classify if the last reading is older than `REFRESH_INTERVAL`
    pub fn refresh_if_due(&self) -> MemoryPressure {
        let due = match *self.last_refresh.lock() {
            Some(at) => at.elapsed() >= REFRESH_INTERVAL,
            None => true,
        };
        if due { self.refresh() } else { self.pressure() }
    }

    #[inline]
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from(self.pressure.load(Ordering::Acquire))
    }

    /// Warning or worse: callers should shrink caches and ring sizes
    #[inline]
    pub fn is_low(&self) -> bool {
        self.pressure() >= MemoryPressure::Warning
    }

    /// Critical or worse: callers should unload cold data
    #[inline]
    pub fn is_critical(&self) -> bool {
        self.pressure() >= MemoryPressure::Critical
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}
