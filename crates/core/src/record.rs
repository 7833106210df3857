//! Decoded filesystem events

use crate::{EventMask, ProcessInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder subject for events whose path could not be resolved
pub const UNRESOLVED_PATH: &str = "<unresolved>";

/// A single decoded filesystem event
///
/// Records are immutable once decoded and are shared downstream by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the record was decoded
    pub timestamp: DateTime<Utc>,
    /// Events that fired (modifier flags removed)
    pub mask: EventMask,
    /// Path of the object the event refers to
    pub subject_path: PathBuf,
    /// Process that caused the event, if the kernel reported one
    pub subject_pid: Option<u32>,
    /// Details of `subject_pid` read while decoding, if it was still alive
    pub process: Option<ProcessInfo>,
    /// Whether the subject is a directory
    pub is_directory: bool,
}

impl EventRecord {
    /// Create a record stamped with the current time
    pub fn new(mask: EventMask, subject_path: impl Into<PathBuf>) -> Self {
        Self {
            timestamp: Utc::now(),
            mask,
            subject_path: subject_path.into(),
            subject_pid: None,
            process: None,
            is_directory: false,
        }
    }

    /// Set the originating pid
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.subject_pid = Some(pid);
        self
    }

    /// Attach process details
    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.subject_pid = Some(process.pid);
        self.process = Some(process);
        self
    }

    /// Mark the subject as a directory
    pub fn with_directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    /// Synthetic record carried by overflow actions
    pub fn overflow(detected_at: DateTime<Utc>) -> Self {
        Self {
            timestamp: detected_at,
            mask: EventMask::QUEUE_OVERFLOW,
            subject_path: PathBuf::new(),
            subject_pid: None,
            process: None,
            is_directory: false,
        }
    }

    /// Subject path
    pub fn path(&self) -> &Path {
        &self.subject_path
    }

    /// Whether this record stands for a queue overflow
    pub fn is_overflow(&self) -> bool {
        self.mask.contains(EventMask::QUEUE_OVERFLOW)
    }

    /// Same event, ignoring when it was decoded
    pub fn same_event(&self, other: &Self) -> bool {
        self.mask == other.mask
            && self.subject_path == other.subject_path
            && self.subject_pid == other.subject_pid
            && self.process == other.process
            && self.is_directory == other.is_directory
    }
}

/// Item forwarded by the dispatch loop to the decision engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A decoded filesystem event
    Event(EventRecord),
    /// The kernel dropped events; history before the next event is incomplete
    Overflow {
        /// When the overflow was observed
        detected_at: DateTime<Utc>,
    },
}

impl Notification {
    /// Overflow observed now
    pub fn overflow() -> Self {
        Self::Overflow {
            detected_at: Utc::now(),
        }
    }

    /// The event record, if this is an event
    pub fn as_event(&self) -> Option<&EventRecord> {
        match self {
            Self::Event(record) => Some(record),
            Self::Overflow { .. } => None,
        }
    }

    /// Whether this is an overflow signal
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }
}

impl From<EventRecord> for Notification {
    fn from(record: EventRecord) -> Self {
        Self::Event(record)
    }
}
