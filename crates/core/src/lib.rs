//! Core data model for fanwatch
//!
//! This crate provides:
//! - `EventMask`, a typed view over the kernel's fanotify event bits
//! - `EventRecord` and `Notification`, the decoded event stream
//! - `ProcessInfo`, what is known about the process behind an event
//! - `Action`, the output of policy classification
//! - Error types shared between the watcher and policy crates

pub mod action;
pub mod error;
pub mod mask;
pub mod process;
pub mod record;

// Re-exports
pub use action::{Action, ActionKind, OVERFLOW_REASON, UNCLASSIFIED_REASON};
pub use error::{MarkError, SourceError};
pub use mask::{EventMask, ParseMaskError};
pub use process::ProcessInfo;
pub use record::{EventRecord, Notification, UNRESOLVED_PATH};
