//! Typed fanotify event masks
//!
//! Bit values match the kernel's `FAN_*` constants, so a mask converts to the
//! wire with `bits()` and decodes with `from_bits_truncate()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

bitflags::bitflags! {
    /// Set of filesystem operations selected for (or reported by) a mark
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u64 {
        /// File was read (`FAN_ACCESS`)
        const ACCESS = 0x0000_0001;
        /// File content was modified (`FAN_MODIFY`)
        const MODIFY = 0x0000_0002;
        /// Metadata changed (`FAN_ATTRIB`)
        const ATTRIB = 0x0000_0004;
        /// Writable file was closed (`FAN_CLOSE_WRITE`)
        const CLOSE_WRITE = 0x0000_0008;
        /// File was opened (`FAN_OPEN`)
        const OPEN = 0x0000_0020;
        /// Entry moved out of a watched directory (`FAN_MOVED_FROM`)
        const MOVED_FROM = 0x0000_0040;
        /// Entry moved into a watched directory (`FAN_MOVED_TO`)
        const MOVED_TO = 0x0000_0080;
        /// Entry created in a watched directory (`FAN_CREATE`)
        const CREATE = 0x0000_0100;
        /// Entry deleted from a watched directory (`FAN_DELETE`)
        const DELETE = 0x0000_0200;
        /// Watched object itself was deleted (`FAN_DELETE_SELF`)
        const DELETE_SELF = 0x0000_0400;
        /// Watched object itself was moved (`FAN_MOVE_SELF`)
        const MOVE_SELF = 0x0000_0800;
        /// File was opened for execution (`FAN_OPEN_EXEC`)
        const EXEC = 0x0000_1000;
        /// Kernel queue overflowed (`FAN_Q_OVERFLOW`); reported, never requested
        const QUEUE_OVERFLOW = 0x0000_4000;
        /// Deliver events for children of a marked directory (`FAN_EVENT_ON_CHILD`)
        const EVENT_ON_CHILD = 0x0800_0000;
        /// Include events on directories themselves (`FAN_ONDIR`)
        const ONDIR = 0x4000_0000;
    }
}

/// Error returned when an event name is not recognized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event name '{0}'")]
pub struct ParseMaskError(pub String);

/// Config names, in display order
const NAMES: &[(&str, EventMask)] = &[
    ("exec", EventMask::EXEC),
    ("access", EventMask::ACCESS),
    ("open", EventMask::OPEN),
    ("modify", EventMask::MODIFY),
    ("attrib", EventMask::ATTRIB),
    ("create", EventMask::CREATE),
    ("delete", EventMask::DELETE),
    ("delete_self", EventMask::DELETE_SELF),
    ("moved_from", EventMask::MOVED_FROM),
    ("moved_to", EventMask::MOVED_TO),
    ("move_self", EventMask::MOVE_SELF),
    ("close_write", EventMask::CLOSE_WRITE),
    ("ondir", EventMask::ONDIR),
    ("on_child", EventMask::EVENT_ON_CHILD),
    ("queue_overflow", EventMask::QUEUE_OVERFLOW),
];

impl EventMask {
    /// Everything a file-activity monitor needs: exec, content, metadata,
    /// directory entries and renames, on directories and their children.
    pub const fn full_coverage() -> Self {
        Self::EXEC
            .union(Self::MODIFY)
            .union(Self::ATTRIB)
            .union(Self::CREATE)
            .union(Self::DELETE)
            .union(Self::MOVED_FROM)
            .union(Self::MOVED_TO)
            .union(Self::CLOSE_WRITE)
            .union(Self::ONDIR)
            .union(Self::EVENT_ON_CHILD)
    }

    /// Content changes only
    pub const fn content() -> Self {
        Self::MODIFY.union(Self::CLOSE_WRITE)
    }

    /// Directory entry changes (create, delete, both rename halves)
    pub const fn directory_entries() -> Self {
        Self::CREATE
            .union(Self::DELETE)
            .union(Self::MOVED_FROM)
            .union(Self::MOVED_TO)
    }

    /// Flags that must both be present for child events of a directory mark
    pub const fn recursive_flags() -> Self {
        Self::ONDIR.union(Self::EVENT_ON_CHILD)
    }

    /// Bits the kernel reports but refuses in a mark request
    pub const fn report_only() -> Self {
        Self::QUEUE_OVERFLOW
    }

    /// Event bits without mark modifiers or report-only bits
    pub fn events(self) -> Self {
        self.difference(Self::recursive_flags())
            .difference(Self::report_only())
    }

    /// Whether the kernel only delivers these events to a group that
    /// reports file handles and names (`FAN_REPORT_DFID_NAME`)
    pub fn requires_name_reporting(self) -> bool {
        self.intersects(
            Self::directory_entries()
                .union(Self::DELETE_SELF)
                .union(Self::MOVE_SELF),
        )
    }

    /// Whether this mask can be sent to `fanotify_mark`
    pub fn is_requestable(self) -> bool {
        !self.intersects(Self::report_only()) && !self.events().is_empty()
    }

    /// Config names of the bits set in this mask
    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(_, bit)| self.contains(*bit))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse a list of event names into a mask
    ///
    /// Accepts the names listed by `names()` plus the aliases `move`
    /// (both rename halves), `write` (content changes) and `all`
    /// (full coverage).
    pub fn parse_list<I, S>(names: I) -> Result<Self, ParseMaskError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Self::empty(), |mask, name| -> Result<Self, ParseMaskError> {
                Ok(mask | name.as_ref().parse::<Self>()?)
            })
    }
}

impl FromStr for EventMask {
    type Err = ParseMaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        match name.as_str() {
            "all" | "full" => return Ok(Self::full_coverage()),
            "move" | "rename" => return Ok(Self::MOVED_FROM | Self::MOVED_TO),
            "write" => return Ok(Self::content()),
            _ => {}
        }

        NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bit)| *bit)
            .ok_or_else(|| ParseMaskError(s.to_string()))
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", names.join("|"))
    }
}
