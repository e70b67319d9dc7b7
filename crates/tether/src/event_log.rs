//! Operator-facing event log
//!
//! The log is a bounded FIFO of [`LogEntry`] values. Every append is pushed
//! to all sessions as `new_log` right away, and each new session gets the
//! retained history once as `logs`. Entries are mirrored into `tracing`.

use std::collections::VecDeque;

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::protocol::ServerEvent;
use crate::server::{ConnectionRegistry, Session};

/// Default number of retained entries
pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO-8601 local time with milliseconds
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            level,
            message: message.into(),
        }
    }
}

/// Bounded, append-only log with immediate fan-out
pub struct LogSink {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    registry: ConnectionRegistry,
}

impl LogSink {
    /// Create a sink holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize, registry: ConnectionRegistry) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            registry,
        }
    }

    /// Store an entry, evict past capacity, and push it to every session
    pub fn append(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry::now(level, message);
        match level {
            LogLevel::Info => info!(target: "tether::oplog", "{}", entry.message),
            LogLevel::Warning => warn!(target: "tether::oplog", "{}", entry.message),
            LogLevel::Error => error!(target: "tether::oplog", "{}", entry.message),
        }

        let mut entries = self.entries.lock();
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        // Pushed under the history lock so replay in `attach` can't overlap it
        self.registry.broadcast(ServerEvent::NewLog(entry.clone()));
        entry
    }

    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.append(LogLevel::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> LogEntry {
        self.append(LogLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.append(LogLevel::Error, message)
    }

    /// Retained entries, oldest first
    pub fn history(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Register a new session that first receives `preamble`, then exactly
    /// one `logs` message with the full retained history.
    pub fn attach(&self, mut preamble: Vec<ServerEvent>) -> Session {
        let entries = self.entries.lock();
        preamble.push(ServerEvent::Logs(entries.iter().cloned().collect()));
        self.registry.register(preamble)
    }
}
