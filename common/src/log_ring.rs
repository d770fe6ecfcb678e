use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use crate::{clock::Clock, error::NodeError};

pub const LOG_CAPACITY: usize = 64;
pub const MAX_MESSAGE_BYTES: usize = 160;

/// Ordered from most to least severe; a threshold admits every level `<=` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            _ => Self::Debug,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = NodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            _ => Err(NodeError::UnknownLogLevel(text.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Receives every admitted entry after the ring lock is released. Must not block.
pub trait LogSink: Send + Sync {
    fn mirror(&self, entry: &LogEntry);
}

pub struct NullSink;

impl LogSink for NullSink {
    fn mirror(&self, _entry: &LogEntry) {}
}

/// Forwards entries to the `tracing` subscriber installed by the binary.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn mirror(&self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Error => tracing::error!(ts = entry.timestamp_ms, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(ts = entry.timestamp_ms, "{}", entry.message),
            LogLevel::Info => tracing::info!(ts = entry.timestamp_ms, "{}", entry.message),
            LogLevel::Debug => tracing::debug!(ts = entry.timestamp_ms, "{}", entry.message),
        }
    }
}

struct Ring {
    slots: Vec<Option<LogEntry>>,
    write_index: usize,
    count: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: vec![None; LOG_CAPACITY],
            write_index: 0,
            count: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.slots[self.write_index] = Some(entry);
        self.write_index = (self.write_index + 1) % LOG_CAPACITY;
        if self.count < LOG_CAPACITY {
            self.count += 1;
        }
    }

    // Most recent `take` entries, oldest first.
    fn recent(&self, max_entries: usize) -> Vec<LogEntry> {
        let take = self.count.min(max_entries);
        let start = (self.write_index + LOG_CAPACITY - take) % LOG_CAPACITY;
        (0..take)
            .filter_map(|i| self.slots[(start + i) % LOG_CAPACITY].clone())
            .collect()
    }
}

/// Bounded diagnostic log shared by every component.
pub struct LogRing {
    ring: Mutex<Ring>,
    threshold: AtomicU8,
    clock: Arc<dyn Clock>,
    sink: Box<dyn LogSink>,
}

impl LogRing {
    pub fn new(clock: Arc<dyn Clock>, sink: Box<dyn LogSink>) -> Self {
        Self {
            ring: Mutex::new(Ring::new()),
            threshold: AtomicU8::new(LogLevel::default() as u8),
            clock,
            sink,
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.threshold.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.threshold.load(Ordering::Relaxed))
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        self.write(level, message);
    }

    /// Formats only when `level` passes the threshold.
    pub fn log_fmt(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        match args.as_str() {
            Some(text) => self.write(level, text),
            None => self.write(level, &args.to_string()),
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log_fmt(LogLevel::Debug, args);
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        *ring = Ring::new();
    }

    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, max_entries: usize) -> Vec<LogEntry> {
        if max_entries == 0 {
            return Vec::new();
        }
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(max_entries)
    }

    fn write(&self, level: LogLevel, message: &str) {
        let entry = LogEntry {
            timestamp_ms: self.clock.now().as_millis(),
            level,
            message: truncate(message, MAX_MESSAGE_BYTES).to_string(),
        };

        {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ring.push(entry.clone());
        }

        self.sink.mirror(&entry);
    }
}

fn truncate(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;

    struct CountingSink(Arc<Mutex<Vec<String>>>);

    impl LogSink for CountingSink {
        fn mirror(&self, entry: &LogEntry) {
            self.0.lock().unwrap().push(entry.message.clone());
        }
    }

    fn ring() -> LogRing {
        LogRing::new(Arc::new(ManualClock::new()), Box::new(NullSink))
    }

    fn messages(entries: &[LogEntry]) -> Vec<String> {
        entries.iter().map(|entry| entry.message.clone()).collect()
    }

    #[test]
    fn buffer_is_bounded_after_overflow() {
        let log = ring();
        for i in 0..100 {
            log.info(format_args!("entry {i}"));
        }

        assert_eq!(log.len(), LOG_CAPACITY);
        let all = log.snapshot(LOG_CAPACITY);
        assert_eq!(all.len(), LOG_CAPACITY);
        assert_eq!(all.first().unwrap().message, "entry 36");
        assert_eq!(all.last().unwrap().message, "entry 99");
        assert_eq!(log.snapshot(1_000).len(), LOG_CAPACITY);
    }

    #[test]
    fn partial_snapshot_returns_most_recent_entries() {
        let log = ring();
        for i in 0..70 {
            log.info(format_args!("entry {i}"));
        }

        assert_eq!(
            messages(&log.snapshot(3)),
            vec!["entry 67", "entry 68", "entry 69"]
        );
    }

    #[test]
    fn partial_snapshot_before_wrap() {
        let log = ring();
        for i in 0..5 {
            log.info(format_args!("entry {i}"));
        }
        assert_eq!(messages(&log.snapshot(2)), vec!["entry 3", "entry 4"]);
        assert_eq!(log.snapshot(0), Vec::new());
    }

    #[test]
    fn clear_empties_the_buffer() {
        let log = ring();
        for i in 0..80 {
            log.warn(format_args!("entry {i}"));
        }
        log.clear();

        assert!(log.is_empty());
        assert!(log.snapshot(LOG_CAPACITY).is_empty());

        log.warn(format_args!("after clear"));
        assert_eq!(messages(&log.snapshot(10)), vec!["after clear"]);
    }

    #[test]
    fn debug_recorded_only_at_debug_threshold() {
        let log = ring();
        for level in [LogLevel::Error, LogLevel::Warn, LogLevel::Info] {
            log.set_level(level);
            log.debug(format_args!("hidden"));
        }
        assert!(log.is_empty());

        log.set_level(LogLevel::Debug);
        log.debug(format_args!("shown"));
        assert_eq!(messages(&log.snapshot(10)), vec!["shown"]);
    }

    #[test]
    fn error_recorded_at_every_threshold() {
        let log = ring();
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
        ] {
            log.set_level(level);
            log.error(format_args!("boom {level}"));
        }
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn long_messages_are_truncated_on_char_boundary() {
        let log = ring();
        let long = "é".repeat(200);
        log.log(LogLevel::Error, &long);

        let entry = &log.snapshot(1)[0];
        assert!(entry.message.len() <= MAX_MESSAGE_BYTES);
        assert_eq!(entry.message.chars().count(), MAX_MESSAGE_BYTES / 2);
    }

    #[test]
    fn sink_sees_only_admitted_entries() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = LogRing::new(
            Arc::new(ManualClock::new()),
            Box::new(CountingSink(seen.clone())),
        );
        log.set_level(LogLevel::Warn);

        log.info(format_args!("filtered"));
        log.warn(format_args!("kept"));

        assert_eq!(*seen.lock().unwrap(), vec!["kept".to_string()]);
    }

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" warn ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error < LogLevel::Debug);
    }
}
