//! Logging levels and the real-time ring logger
//!
//! Control-plane code logs through the `log` facade directly. The audio
//! thread must not allocate or lock, so it formats into fixed-size records
//! and pushes them onto a pre-allocated `rtrb` ring; a control thread drains
//! the ring into `log` later.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::now_micros;

/// Maximum bytes of text kept per real-time record
pub const RT_MESSAGE_CAPACITY: usize = 120;

/// Default number of records in a real-time log ring
pub const DEFAULT_RT_LOG_CAPACITY: usize = 256;

/// Target used when real-time records are forwarded to `log`
pub const RT_LOG_TARGET: &str = "orb::rt";

/// Engine log levels, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Verbose => log::Level::Trace,
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Verbose,
        }
    }
}

/// Set the runtime filter. Levels above `log::STATIC_MAX_LEVEL` stay compiled out.
pub fn set_level(level: LogLevel) {
    log::set_max_level(log::Level::from(level).to_level_filter());
}

/// Whether a level passes both the compile-time and runtime filters
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    let level = log::Level::from(level);
    level <= log::STATIC_MAX_LEVEL && level <= log::max_level()
}

// ═══════════════════════════════════════════════════════════════════════════════
// REAL-TIME RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-size log record produced on the audio thread
#[derive(Clone, Copy)]
pub struct RtLogRecord {
    pub timestamp_us: u64,
    pub level: LogLevel,
    len: u8,
    text: [u8; RT_MESSAGE_CAPACITY],
}

impl RtLogRecord {
    fn new(level: LogLevel) -> Self {
        Self {
            timestamp_us: now_micros(),
            level,
            len: 0,
            text: [0; RT_MESSAGE_CAPACITY],
        }
    }

    pub fn message(&self) -> &str {
        std::str::from_utf8(&self.text[..self.len as usize]).unwrap_or("")
    }

    /// True when the formatted text did not fit
    pub fn truncated(&self) -> bool {
        self.len as usize == RT_MESSAGE_CAPACITY
    }
}

impl fmt::Write for RtLogRecord {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let used = self.len as usize;
        let room = RT_MESSAGE_CAPACITY - used;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.text[used..used + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len = (used + take) as u8;
        Ok(())
    }
}

impl fmt::Debug for RtLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtLogRecord")
            .field("timestamp_us", &self.timestamp_us)
            .field("level", &self.level)
            .field("message", &self.message())
            .finish()
    }
}

/// Create a connected writer/reader pair with room for `capacity` records
pub fn rt_channel(capacity: usize) -> (RtLogWriter, RtLogReader) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        RtLogWriter {
            producer,
            dropped: Arc::clone(&dropped),
            min_level: LogLevel::Verbose,
        },
        RtLogReader { consumer, dropped },
    )
}

/// Audio-thread side. Never allocates, never blocks.
pub struct RtLogWriter {
    producer: rtrb::Producer<RtLogRecord>,
    dropped: Arc<AtomicU64>,
    min_level: LogLevel,
}

impl RtLogWriter {
    /// Ignore records less severe than `level`
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Format and enqueue a record. Returns false if filtered or dropped.
    pub fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) -> bool {
        if level > self.min_level {
            return false;
        }

        let mut record = RtLogRecord::new(level);
        let _ = record.write_fmt(args);

        if self.producer.push(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

/// Control-thread side
pub struct RtLogReader {
    consumer: rtrb::Consumer<RtLogRecord>,
    dropped: Arc<AtomicU64>,
}

impl RtLogReader {
    /// Forward every pending record to `log`. Returns the number forwarded.
    pub fn drain(&mut self) -> usize {
        self.drain_with(|record| {
            log::log!(
                target: RT_LOG_TARGET,
                log::Level::from(record.level),
                "[{}us] {}",
                record.timestamp_us,
                record.message()
            );
        })
    }

    /// Hand every pending record to `f`
    pub fn drain_with<F: FnMut(&RtLogRecord)>(&mut self, mut f: F) -> usize {
        let mut count = 0;
        while let Ok(record) = self.consumer.pop() {
            f(&record);
            count += 1;
        }
        count
    }

    /// Records lost because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Log from the audio thread through an `RtLogWriter`
#[macro_export]
macro_rules! rt_log {
    ($writer:expr, $level:expr, $($arg:tt)+) => {
        $writer.log($level, ::std::format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_arrive_in_order() {
        let (mut writer, mut reader) = rt_channel(8);
        assert!(crate::rt_log!(writer, LogLevel::Warning, "underrun on track {}", 3));
        assert!(crate::rt_log!(writer, LogLevel::Info, "block {}", 42));

        let mut messages = Vec::new();
        reader.drain_with(|r| messages.push((r.level, r.message().to_string())));

        assert_eq!(
            messages,
            vec![
                (LogLevel::Warning, "underrun on track 3".to_string()),
                (LogLevel::Info, "block 42".to_string()),
            ]
        );
    }

    #[test]
    fn test_full_ring_counts_drops() {
        let (mut writer, reader) = rt_channel(2);
        for i in 0..5 {
            crate::rt_log!(writer, LogLevel::Error, "e{}", i);
        }
        assert_eq!(reader.dropped(), 3);
    }

    #[test]
    fn test_level_filter() {
        let (mut writer, mut reader) = rt_channel(4);
        writer.set_level(LogLevel::Warning);
        assert!(!crate::rt_log!(writer, LogLevel::Debug, "noise"));
        assert_eq!(reader.drain(), 0);
    }

    #[test]
    fn test_long_message_truncates_on_char_boundary() {
        let (mut writer, mut reader) = rt_channel(1);
        let long = "é".repeat(RT_MESSAGE_CAPACITY);
        crate::rt_log!(writer, LogLevel::Info, "{}", long);

        reader.drain_with(|r| {
            assert!(r.message().len() <= RT_MESSAGE_CAPACITY);
            assert!(r.message().chars().all(|c| c == 'é'));
        });
    }

    #[test]
    fn test_level_ordering_matches_log() {
        assert!(LogLevel::Error < LogLevel::Verbose);
        assert_eq!(log::Level::from(LogLevel::Verbose), log::Level::Trace);
        assert_eq!(LogLevel::from(log::Level::Warn), LogLevel::Warning);
    }
}
