//! Logging port for the polling stack
//!
//! Components never log through a process-wide handle directly. Each one is handed
//! a [`Logger`] at construction, which tags records with the component's target and
//! forwards them to a [`LogSink`]. The default sink feeds the `log` facade; tests
//! use [`MemoryLogSink`] to inspect what was recorded.
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// A log entry with timestamp and message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

/// Log entry severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl LogEntry {
    pub fn new(target: &str, level: LogLevel, message: String) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            target: target.to_string(),
            message,
        }
    }
}

/// Destination for log records
pub trait LogSink: Send + Sync {
    /// Cheap pre-check so disabled levels skip formatting
    fn enabled(&self, _target: &str, _level: LogLevel) -> bool {
        true
    }

    fn record(&self, target: &str, level: LogLevel, message: fmt::Arguments<'_>);
}

/// Forwards records to whatever `log` backend the binary installed
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn enabled(&self, target: &str, level: LogLevel) -> bool {
        log::log_enabled!(target: target, log::Level::from(level))
    }

    fn record(&self, target: &str, level: LogLevel, message: fmt::Arguments<'_>) {
        log::log!(target: target, log::Level::from(level), "{}", message);
    }
}

/// Keeps the most recent entries in memory
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
    max_entries: usize,
}

impl MemoryLogSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Whether any entry at `level` contains `needle`
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.level == level && entry.message.contains(needle))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for MemoryLogSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, target: &str, level: LogLevel, message: fmt::Arguments<'_>) {
        let mut entries = self.entries.lock();
        entries.push(LogEntry::new(target, level, message.to_string()));

        // Trim oldest entries if we exceed the max
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }
}

/// Handle passed into each component
#[derive(Clone)]
pub struct Logger {
    target: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("servolink", Arc::new(LogCrateSink))
    }
}

impl Logger {
    pub fn new(target: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            target: Arc::from(target),
            sink,
        }
    }

    /// Same sink, nested target (`parent::name`)
    pub fn child(&self, name: &str) -> Self {
        Self {
            target: Arc::from(format!("{}::{}", self.target, name)),
            sink: self.sink.clone(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        if self.sink.enabled(&self.target, level) {
            self.sink.record(&self.target, level, message);
        }
    }

    pub fn debug(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, message);
    }
}
