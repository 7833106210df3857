//! In-memory event source for tests and replay
//!
//! `ScriptedSource` plays back a queue of canned read outcomes and keeps a
//! mark table the way the kernel would, with knobs for mark limits and
//! failing paths. `RawEventBuilder` encodes wire-format records.

use crate::resolve::{FileHandle, PathResolver};
use crate::source::{Capabilities, EventSource, ReadOutcome, Readiness};
use crate::sys::*;
use ahash::{AHashMap, AHashSet};
use fanwatch_core::{EventMask, MarkError, ProcessInfo};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One scripted read
#[derive(Debug)]
pub enum Step {
    /// Raw event bytes; delivered across several reads if the caller's
    /// buffer is smaller
    Data(Vec<u8>),
    /// Nothing pending
    WouldBlock,
    /// Out-of-band overflow
    Overflow,
    /// Read failure
    Fail(io::ErrorKind),
    /// Source goes away
    Close,
}

/// What happens once every step has been played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Report `Closed`
    Close,
    /// Report `WouldBlock` forever
    Idle,
}

/// Scripted `EventSource`
#[derive(Debug)]
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    partial: Vec<u8>,
    end: ScriptEnd,
    capabilities: Capabilities,
    marks: BTreeMap<PathBuf, (EventMask, bool)>,
    mark_limit: Option<usize>,
    denied: AHashSet<PathBuf>,
    missing: AHashSet<PathBuf>,
    unmark_failures: AHashMap<PathBuf, usize>,
    resolver: MapResolver,
    closed: bool,
    close_calls: usize,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// Empty script that reports `Closed` once exhausted
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            partial: Vec::new(),
            end: ScriptEnd::Close,
            capabilities: Capabilities::default(),
            marks: BTreeMap::new(),
            mark_limit: None,
            denied: AHashSet::new(),
            missing: AHashSet::new(),
            unmark_failures: AHashMap::new(),
            resolver: MapResolver::new(),
            closed: false,
            close_calls: 0,
        }
    }

    /// Append a step
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    /// Append raw event bytes
    pub fn data(self, bytes: Vec<u8>) -> Self {
        self.step(Step::Data(bytes))
    }

    /// Behaviour after the last step
    pub fn ending(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Allow at most `limit` distinct marked paths
    pub fn with_mark_limit(mut self, limit: usize) -> Self {
        self.mark_limit = Some(limit);
        self
    }

    /// Marking `path` fails with `PermissionDenied`
    pub fn deny(mut self, path: impl Into<PathBuf>) -> Self {
        self.denied.insert(path.into());
        self
    }

    /// Marking `path` fails with `PathNotFound`
    pub fn missing(mut self, path: impl Into<PathBuf>) -> Self {
        self.missing.insert(path.into());
        self
    }

    /// The next `times` unmarks of `path` fail with `PermissionDenied` and
    /// leave the mark in place
    pub fn fail_unmark(mut self, path: impl Into<PathBuf>, times: usize) -> Self {
        self.unmark_failures.insert(path.into(), times);
        self
    }

    /// Behave like a kernel without name reporting
    pub fn without_names(mut self) -> Self {
        self.capabilities.report_names = false;
        self
    }

    /// Hand back each data step in one read, the way the kernel does
    pub fn whole_records(mut self) -> Self {
        self.capabilities.whole_records = true;
        self
    }

    /// Resolver handed to decoders
    pub fn with_resolver(mut self, resolver: MapResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Queue a step on a source that is already in use
    pub fn push(&mut self, step: Step) {
        self.steps.push_back(step);
    }

    /// Current mark on `path`
    pub fn mark_of(&self, path: &Path) -> Option<EventMask> {
        self.marks.get(path).map(|(mask, _)| *mask)
    }

    /// Marked paths in order
    pub fn marked_paths(&self) -> Vec<PathBuf> {
        self.marks.keys().cloned().collect()
    }

    /// Steps not yet played
    pub fn remaining_steps(&self) -> usize {
        self.steps.len()
    }

    /// How many times `close` ran
    pub fn close_calls(&self) -> usize {
        self.close_calls
    }
}

impl EventSource for ScriptedSource {
    type Resolver = MapResolver;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn mark(&mut self, path: &Path, mask: EventMask, recursive: bool) -> Result<(), MarkError> {
        if self.closed {
            return Err(MarkError::Closed);
        }
        if self.missing.contains(path) {
            return Err(MarkError::PathNotFound(path.to_path_buf()));
        }
        if self.denied.contains(path) {
            return Err(MarkError::PermissionDenied(path.to_path_buf()));
        }
        if !mask.is_requestable()
            || (mask.requires_name_reporting() && !self.capabilities.report_names)
        {
            return Err(MarkError::Unsupported(mask));
        }

        if !self.marks.contains_key(path) {
            if let Some(limit) = self.mark_limit {
                if self.marks.len() >= limit {
                    return Err(MarkError::MarkLimitExceeded(path.to_path_buf()));
                }
            }
        }

        let entry = self
            .marks
            .entry(path.to_path_buf())
            .or_insert((EventMask::empty(), recursive));
        entry.0 |= mask;
        entry.1 |= recursive;
        Ok(())
    }

    fn unmark(&mut self, path: &Path) -> Result<(), MarkError> {
        if self.closed {
            return Err(MarkError::Closed);
        }
        if let Some(left) = self.unmark_failures.get_mut(path).filter(|left| **left > 0) {
            *left -= 1;
            return Err(MarkError::PermissionDenied(path.to_path_buf()));
        }
        self.marks.remove(path);
        Ok(())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }

        if !self.partial.is_empty() {
            return deliver(&mut self.partial, buf);
        }

        match self.steps.pop_front() {
            // The kernel rejects a buffer too small for the next record
            Some(Step::Data(bytes)) if self.capabilities.whole_records && bytes.len() > buf.len() => {
                ReadOutcome::Failed(io::Error::from(io::ErrorKind::InvalidInput))
            }
            Some(Step::Data(mut bytes)) => {
                let outcome = deliver(&mut bytes, buf);
                self.partial = bytes;
                outcome
            }
            Some(Step::WouldBlock) => ReadOutcome::WouldBlock,
            Some(Step::Overflow) => ReadOutcome::QueueOverflow,
            Some(Step::Fail(kind)) => ReadOutcome::Failed(io::Error::from(kind)),
            Some(Step::Close) => {
                self.closed = true;
                ReadOutcome::Closed
            }
            None => match self.end {
                ScriptEnd::Close => ReadOutcome::Closed,
                ScriptEnd::Idle => ReadOutcome::WouldBlock,
            },
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness::Always
    }

    fn resolver(&self) -> MapResolver {
        self.resolver.clone()
    }

    fn close(&mut self) {
        self.closed = true;
        self.close_calls += 1;
        self.marks.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Move up to `buf.len()` bytes from the front of `pending` into `buf`
fn deliver(pending: &mut Vec<u8>, buf: &mut [u8]) -> ReadOutcome {
    let n = pending.len().min(buf.len());
    buf[..n].copy_from_slice(&pending[..n]);
    pending.drain(..n);
    ReadOutcome::Data(n)
}

/// Resolver backed by fixed fd and handle tables
///
/// Clones share the record of released descriptors.
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    fds: AHashMap<RawFd, PathBuf>,
    handles: AHashMap<Vec<u8>, PathBuf>,
    processes: AHashMap<u32, ProcessInfo>,
    released: Arc<Mutex<Vec<RawFd>>>,
}

impl MapResolver {
    /// Empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve event fd `fd` to `path`
    pub fn with_fd(mut self, fd: RawFd, path: impl Into<PathBuf>) -> Self {
        self.fds.insert(fd, path.into());
        self
    }

    /// Resolve a handle with these bytes to `path`
    pub fn with_handle(mut self, handle: &[u8], path: impl Into<PathBuf>) -> Self {
        self.handles.insert(handle.to_vec(), path.into());
        self
    }

    /// Report `process` for its pid; other pids look exited
    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.processes.insert(process.pid, process);
        self
    }

    /// Descriptors closed without being resolved, in order
    pub fn released_fds(&self) -> Vec<RawFd> {
        self.released.lock().clone()
    }
}

impl PathResolver for MapResolver {
    fn resolve_fd(&self, fd: RawFd) -> Option<PathBuf> {
        self.fds.get(&fd).cloned()
    }

    fn release_fd(&self, fd: RawFd) {
        self.released.lock().push(fd);
    }

    fn resolve_handle(&self, handle: &FileHandle<'_>) -> Option<PathBuf> {
        self.handles.get(handle.bytes).cloned()
    }

    fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes.get(&pid).cloned()
    }
}

/// Encoder for fanotify wire records
#[derive(Debug, Default, Clone)]
pub struct RawEventBuilder {
    buf: Vec<u8>,
}

impl RawEventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event carrying an open descriptor
    pub fn fd_event(self, mask: EventMask, fd: RawFd, pid: i32) -> Self {
        self.raw_metadata(
            FAN_EVENT_METADATA_LEN as u32,
            FANOTIFY_METADATA_VERSION,
            FAN_EVENT_METADATA_LEN as u16,
            mask.bits(),
            fd,
            pid,
        )
    }

    /// Event carrying a directory handle and entry name
    pub fn name_event(mut self, mask: EventMask, pid: i32, dir_handle: &[u8], name: &str) -> Self {
        let mut info = Vec::new();
        info.extend_from_slice(&[0u8; 8]); // fsid
        info.extend_from_slice(&(dir_handle.len() as u32).to_ne_bytes());
        info.extend_from_slice(&1i32.to_ne_bytes()); // handle_type
        info.extend_from_slice(dir_handle);
        info.extend_from_slice(name.as_bytes());
        info.push(0);
        while (FAN_EVENT_INFO_HEADER_LEN + info.len()) % 4 != 0 {
            info.push(0);
        }

        let info_len = FAN_EVENT_INFO_HEADER_LEN + info.len();
        let event_len = FAN_EVENT_METADATA_LEN + info_len;

        self = self.raw_metadata(
            event_len as u32,
            FANOTIFY_METADATA_VERSION,
            FAN_EVENT_METADATA_LEN as u16,
            mask.bits(),
            FAN_NOFD,
            pid,
        );
        self.buf.push(FAN_EVENT_INFO_TYPE_DFID_NAME);
        self.buf.push(0);
        self.buf.extend_from_slice(&(info_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&info);
        self
    }

    /// Queue overflow record
    pub fn overflow(self) -> Self {
        self.fd_event(EventMask::QUEUE_OVERFLOW, FAN_NOFD, 0)
    }

    /// Bare metadata header with arbitrary field values
    pub fn raw_metadata(
        mut self,
        event_len: u32,
        vers: u8,
        metadata_len: u16,
        mask: u64,
        fd: RawFd,
        pid: i32,
    ) -> Self {
        self.buf.extend_from_slice(&event_len.to_ne_bytes());
        self.buf.push(vers);
        self.buf.push(0);
        self.buf.extend_from_slice(&metadata_len.to_ne_bytes());
        self.buf.extend_from_slice(&mask.to_ne_bytes());
        self.buf.extend_from_slice(&fd.to_ne_bytes());
        self.buf.extend_from_slice(&pid.to_ne_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}
