//! Operator notes
//!
//! Short free-text messages a port attaches to itself when something worth
//! an operator's attention happens: a failed attach, a clock anomaly on the
//! receive path, a refused configuration change.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Default number of notes a [`NoteLog`] keeps
pub const DEFAULT_NOTE_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// One recorded note
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    pub severity: Severity,
    pub message: String,
    pub at: SystemTime,
}

/// Where a port's notes go
pub trait NoteSink: Send + Sync {
    fn add_note(&self, severity: Severity, message: String);

    /// Notes still retained, oldest first
    fn history(&self) -> Vec<Note> {
        Vec::new()
    }
}

/// Logs notes through `tracing` and keeps the most recent ones
#[derive(Debug)]
pub struct NoteLog {
    capacity: usize,
    notes: Mutex<VecDeque<Note>>,
}

impl NoteLog {
    pub fn new(capacity: usize) -> Self {
        NoteLog {
            capacity: capacity.max(1),
            notes: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }

    pub fn clear(&self) {
        self.notes.lock().clear();
    }
}

impl Default for NoteLog {
    fn default() -> Self {
        NoteLog::new(DEFAULT_NOTE_HISTORY)
    }
}

impl NoteSink for NoteLog {
    fn add_note(&self, severity: Severity, message: String) {
        match severity {
            Severity::Info => tracing::info!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }

        let mut notes = self.notes.lock();
        if notes.len() == self.capacity {
            notes.pop_front();
        }
        notes.push_back(Note {
            severity,
            message,
            at: SystemTime::now(),
        });
    }

    fn history(&self) -> Vec<Note> {
        self.notes.lock().iter().cloned().collect()
    }
}
