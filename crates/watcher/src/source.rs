//! The event source seam
//!
//! Everything that talks to the kernel notification group goes through
//! `EventSource`. The dispatch loop and the watch registry share one source
//! behind a mutex; the loop only holds that lock for a single non-blocking
//! read.

use crate::resolve::PathResolver;
use fanwatch_core::{EventMask, MarkError};
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

/// Result of one non-blocking read attempt
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes of raw event data were written to the caller's buffer
    Data(usize),
    /// Nothing pending
    WouldBlock,
    /// The source dropped events before this read
    QueueOverflow,
    /// The source is gone; no further reads will succeed
    Closed,
    /// Unrecoverable read failure
    Failed(io::Error),
}

/// How the dispatch loop waits for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Poll this descriptor for `POLLIN`
    Fd(RawFd),
    /// In-memory source, always readable
    Always,
}

/// Features negotiated when the source was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Events carry directory handles and entry names, which the kernel
    /// requires for create/delete/move events
    pub report_names: bool,
    /// Every read ends on a record boundary, so a record that overruns the
    /// read is corrupt rather than continued
    pub whole_records: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            report_names: true,
            whole_records: false,
        }
    }
}

/// Options for opening a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    /// Ask for name reporting; falls back without it on older kernels
    pub request_names: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { request_names: true }
    }
}

/// A kernel notification group (or a stand-in for one)
pub trait EventSource: Send {
    /// Resolver matching the references this source embeds in its events
    type Resolver: PathResolver + Send + 'static;

    /// Negotiated capabilities
    fn capabilities(&self) -> Capabilities;

    /// Add `mask` to the mark on `path` (and its sub-directories when
    /// `recursive`). Marks are additive.
    fn mark(&mut self, path: &Path, mask: EventMask, recursive: bool) -> Result<(), MarkError>;

    /// Remove the mark on `path`. Unknown paths are a no-op.
    fn unmark(&mut self, path: &Path) -> Result<(), MarkError>;

    /// Read pending raw event bytes without blocking
    fn read_raw(&mut self, buf: &mut [u8]) -> ReadOutcome;

    /// How to wait for this source to become readable
    fn readiness(&self) -> Readiness;

    /// Resolver for decoding this source's events
    fn resolver(&self) -> Self::Resolver;

    /// Release the underlying handle. Later reads report `Closed`.
    fn close(&mut self);

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}
