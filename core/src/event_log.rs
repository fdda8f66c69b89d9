//! Event Log
//!
//! Bounded, ordered record of session lifecycle events for presentation layers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single timestamped log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: SystemTime,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self
            .at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        write!(f, "[{}] {}", ms, self.message)
    }
}

struct LogState {
    entries: VecDeque<LogEntry>,
    total: u64,
}

/// Append-only event log that keeps the most recent `capacity` entries.
pub struct EventLog {
    capacity: usize,
    state: Mutex<LogState>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        EventLog {
            capacity,
            state: Mutex::new(LogState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                total: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, evicting the oldest entry once full.
    pub fn append(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);

        let mut state = self.lock();
        state.total += 1;
        if self.capacity == 0 {
            return;
        }
        while state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(LogEntry {
            at: SystemTime::now(),
            message,
        });
    }

    /// Retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Retained messages without timestamps, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.lock().entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries ever appended, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.lock().total
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        // A panic while appending cannot leave the deque half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
