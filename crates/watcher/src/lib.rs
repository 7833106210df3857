//! Kernel file-activity watching for fanwatch
//!
//! This crate provides:
//! - The `EventSource` seam and its fanotify implementation
//! - A watch registry that owns the set of marked paths
//! - A decoder for the variable-length fanotify event stream
//! - The dispatch loop that drains the source and forwards notifications
//! - Periodic reconciliation of the watch set

pub mod decode;
pub mod dispatch;
pub mod platform;
pub mod reconcile;
pub mod registry;
pub mod resolve;
pub mod scripted;
pub mod source;
pub mod sys;

// Re-exports
pub use decode::{decode, DecodeLimits, Decoded, Decoder, MalformedReason, MalformedRecord};
pub use dispatch::{DispatchConfig, DispatchError, DispatchLoop, DispatchStats, LoopState, StopHandle};
pub use reconcile::{ReconcileReport, Reconciler};
pub use registry::{SharedSource, WatchDescriptor, WatchEntry, WatchRegistry};
pub use resolve::{FileHandle, PathResolver};
pub use source::{Capabilities, EventSource, ReadOutcome, Readiness, SourceOptions};

#[cfg(target_os = "linux")]
pub use platform::linux::{FanotifySource, ProcResolver};
