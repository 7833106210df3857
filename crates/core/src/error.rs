//! Errors raised while talking to the kernel notification facility

use crate::EventMask;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The notification group could not be created
#[derive(Debug, Error)]
pub enum SourceError {
    /// Facility missing, not permitted, or out of resources
    #[error("event source unavailable: {reason}")]
    Unavailable {
        /// What went wrong, for the operator
        reason: String,
        /// Underlying OS error, if any
        #[source]
        source: Option<io::Error>,
    },
}

impl SourceError {
    /// Unavailable without an OS error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            source: None,
        }
    }

    /// Unavailable because of an OS error
    pub fn from_io(reason: impl Into<String>, err: io::Error) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            source: Some(err),
        }
    }
}

/// A watch could not be added or removed
///
/// Mark errors are per-path: they never affect other watches.
#[derive(Debug, Error)]
pub enum MarkError {
    /// Path does not exist (or a component is not a directory)
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// Kernel mark limit reached
    #[error("mark limit exceeded while watching {}", .0.display())]
    MarkLimitExceeded(PathBuf),

    /// Caller lacks the privilege to mark this path
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// Requested bits are not available on this kernel or source
    #[error("unsupported event mask {0}")]
    Unsupported(EventMask),

    /// Source was closed
    #[error("event source is closed")]
    Closed,

    /// Any other OS failure
    #[error("mark failed for {}: {source}", .path.display())]
    Io {
        /// Path being marked
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl MarkError {
    /// Map an OS error from `fanotify_mark` to the matching variant
    pub fn from_os(path: PathBuf, mask: EventMask, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => Self::PathNotFound(path),
            Some(libc::ENOSPC) => Self::MarkLimitExceeded(path),
            Some(libc::EPERM) | Some(libc::EACCES) => Self::PermissionDenied(path),
            Some(libc::EINVAL)
            | Some(libc::EOPNOTSUPP)
            | Some(libc::ENODEV)
            | Some(libc::EXDEV) => Self::Unsupported(mask),
            _ => Self::Io { path, source: err },
        }
    }

    /// Whether the watched object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound(_))
    }
}
