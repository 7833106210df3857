//! Turning event object references into paths
//!
//! fanotify identifies the subject of an event either by an open file
//! descriptor or by a file handle (plus an entry name). Both are only
//! meaningful while the raw event is being decoded, so the decoder resolves
//! them immediately through a `PathResolver`. The same goes for the pid of
//! the process behind the event.

use fanwatch_core::ProcessInfo;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// A kernel file handle as embedded in a fid info record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle<'a> {
    /// Filesystem id the handle belongs to
    pub fsid: [i32; 2],
    /// Filesystem-specific handle type
    pub handle_type: i32,
    /// Opaque handle bytes
    pub bytes: &'a [u8],
}

/// Resolves event object references into paths
pub trait PathResolver {
    /// Resolve an event file descriptor.
    ///
    /// Takes ownership of `fd`: implementations backed by a real group must
    /// close it, whether or not resolution succeeds.
    fn resolve_fd(&self, fd: RawFd) -> Option<PathBuf>;

    /// Close an event file descriptor without resolving it
    fn release_fd(&self, fd: RawFd);

    /// Resolve a file handle to the path of the object it names
    fn resolve_handle(&self, handle: &FileHandle<'_>) -> Option<PathBuf>;

    /// Look up the process behind an event. `None` once it has exited.
    fn process_info(&self, pid: u32) -> Option<ProcessInfo>;
}

impl<R: PathResolver + ?Sized> PathResolver for &R {
    fn resolve_fd(&self, fd: RawFd) -> Option<PathBuf> {
        (**self).resolve_fd(fd)
    }

    fn release_fd(&self, fd: RawFd) {
        (**self).release_fd(fd)
    }

    fn resolve_handle(&self, handle: &FileHandle<'_>) -> Option<PathBuf> {
        (**self).resolve_handle(handle)
    }

    fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        (**self).process_info(pid)
    }
}
