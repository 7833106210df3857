//! fanotify event stream decoder
//!
//! A read from the notification group yields a sequence of variable-length
//! records: a fixed `fanotify_event_metadata` header followed by optional
//! info records. The decoder turns them into `Notification`s in stream
//! order, resolving object references to paths as it goes.
//!
//! Boundary handling:
//! - A record cut off by the end of the buffer is left in the remainder and
//!   completed by the next read, unless the source only ever returns whole
//!   records (`DecodeLimits::whole_records`). The kernel does, so there the
//!   overrun is reported as `MalformedRecord`.
//! - A record whose header is inconsistent is reported as `MalformedRecord`.
//!   Nothing after it can be trusted, so the rest of the buffer is dropped;
//!   records decoded before it are handed back in `salvaged`. Descriptors
//!   carried by dropped records that can still be framed are closed.

use crate::resolve::{FileHandle, PathResolver};
use crate::sys::*;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use fanwatch_core::{EventMask, EventRecord, Notification, UNRESOLVED_PATH};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Default upper bound on a single record
///
/// The largest record the kernel emits (header, a fid info with a
/// `MAX_HANDLE_SZ` handle and a `NAME_MAX` name) is well under this.
pub const DEFAULT_MAX_RECORD_LEN: usize = 4096;

/// Decoder limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Declared lengths above this are corrupt, not partial
    pub max_record_len: usize,
    /// Reads never split a record; a record running past the end of the
    /// buffer is corrupt
    pub whole_records: bool,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            whole_records: false,
        }
    }
}

/// Why a record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("unsupported metadata version {0}")]
    Version(u8),

    #[error("metadata length {0} is shorter than the fixed header")]
    ShortMetadata(u16),

    #[error("event length {event_len} is shorter than metadata length {metadata_len}")]
    ShortEvent { event_len: usize, metadata_len: usize },

    #[error("event length {event_len} exceeds the {max} byte record limit")]
    Oversized { event_len: usize, max: usize },

    #[error("event length {event_len} overruns the {available} bytes left in the read")]
    Truncated { event_len: usize, available: usize },

    #[error("{0} trailing bytes are too short for a record header")]
    TrailingBytes(usize),

    #[error("info record at offset {0} overruns its event")]
    InfoOverrun(usize),

    #[error("file handle of {0} bytes overruns its info record")]
    HandleOverrun(usize),
}

/// A record whose declared layout does not fit the buffer
#[derive(Debug, Error)]
#[error("malformed record at offset {offset}: {reason}")]
pub struct MalformedRecord {
    /// Byte offset of the bad record in the decoded buffer
    pub offset: usize,
    /// What was wrong with it
    pub reason: MalformedReason,
    /// Notifications decoded before the bad record, in order
    pub salvaged: Vec<Notification>,
}

/// Output of a successful decode
#[derive(Debug)]
pub struct Decoded<'a> {
    /// Notifications in stream order
    pub notifications: Vec<Notification>,
    /// Undecoded tail (an incomplete record), to prepend to the next read
    pub remainder: &'a [u8],
}

/// Decode every complete record in `buf`
pub fn decode<'a, R>(
    buf: &'a [u8],
    resolver: &R,
    limits: &DecodeLimits,
) -> Result<Decoded<'a>, MalformedRecord>
where
    R: PathResolver + ?Sized,
{
    let now = Utc::now();
    let mut notifications = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= FAN_EVENT_METADATA_LEN {
        let rest = &buf[offset..];

        let header = match Header::parse(rest, limits) {
            Ok(header) => header,
            Err(reason) => {
                return Err(MalformedRecord {
                    offset,
                    reason,
                    salvaged: notifications,
                })
            }
        };

        if header.event_len > rest.len() {
            if limits.whole_records {
                return Err(MalformedRecord {
                    offset,
                    reason: MalformedReason::Truncated {
                        event_len: header.event_len,
                        available: rest.len(),
                    },
                    salvaged: notifications,
                });
            }
            // Record continues in the next read
            break;
        }

        match decode_event(&header, &rest[..header.event_len], resolver, now) {
            Ok(notification) => notifications.push(notification),
            Err(reason) => {
                let released = release_tail(&rest[header.event_len..], resolver, limits);
                if released > 0 {
                    debug!(released, "Closed descriptors of discarded records");
                }
                return Err(MalformedRecord {
                    offset,
                    reason,
                    salvaged: notifications,
                });
            }
        }

        offset += header.event_len;
    }

    if limits.whole_records && offset < buf.len() {
        return Err(MalformedRecord {
            offset,
            reason: MalformedReason::TrailingBytes(buf.len() - offset),
            salvaged: notifications,
        });
    }

    Ok(Decoded {
        notifications,
        remainder: &buf[offset..],
    })
}

/// Stateful decoder that carries incomplete records between reads
pub struct Decoder<R> {
    resolver: R,
    limits: DecodeLimits,
    pending: BytesMut,
}

impl<R: PathResolver> Decoder<R> {
    /// Create a decoder
    pub fn new(resolver: R, limits: DecodeLimits) -> Self {
        Self {
            resolver,
            limits,
            pending: BytesMut::new(),
        }
    }

    /// Decode the next read, prefixed with whatever was left over
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Notification>, MalformedRecord> {
        if self.pending.is_empty() {
            let decoded = decode(bytes, &self.resolver, &self.limits)?;
            self.pending.extend_from_slice(decoded.remainder);
            return Ok(decoded.notifications);
        }

        self.pending.extend_from_slice(bytes);
        let buf = self.pending.split().freeze();
        let decoded = decode(&buf, &self.resolver, &self.limits)?;
        self.pending.extend_from_slice(decoded.remainder);
        Ok(decoded.notifications)
    }

    /// Bytes of an incomplete record waiting for the next read
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any incomplete record
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Resolver used for object references
    pub fn resolver(&self) -> &R {
        &self.resolver
    }
}

/// Validated `fanotify_event_metadata`
#[derive(Debug, Clone, Copy)]
struct Header {
    event_len: usize,
    metadata_len: usize,
    mask: u64,
    fd: i32,
    pid: i32,
}

impl Header {
    /// Parse and check the fixed header; `buf` holds at least
    /// `FAN_EVENT_METADATA_LEN` bytes.
    fn parse(buf: &[u8], limits: &DecodeLimits) -> Result<Self, MalformedReason> {
        let event_len = read_u32(buf, 0) as usize;
        let vers = buf[4];
        let metadata_len = read_u16(buf, 6);

        if vers != FANOTIFY_METADATA_VERSION {
            return Err(MalformedReason::Version(vers));
        }
        if (metadata_len as usize) < FAN_EVENT_METADATA_LEN {
            return Err(MalformedReason::ShortMetadata(metadata_len));
        }
        if event_len < metadata_len as usize {
            return Err(MalformedReason::ShortEvent {
                event_len,
                metadata_len: metadata_len as usize,
            });
        }
        if event_len > limits.max_record_len {
            return Err(MalformedReason::Oversized {
                event_len,
                max: limits.max_record_len,
            });
        }

        Ok(Self {
            event_len,
            metadata_len: metadata_len as usize,
            mask: read_u64(buf, 8),
            fd: read_i32(buf, 16),
            pid: read_i32(buf, 20),
        })
    }
}

/// Object references carried by a record's info section
#[derive(Default)]
struct InfoRefs<'a> {
    dir: Option<FileHandle<'a>>,
    object: Option<FileHandle<'a>>,
    name: Option<&'a [u8]>,
}

fn decode_event<R>(
    header: &Header,
    event: &[u8],
    resolver: &R,
    now: DateTime<Utc>,
) -> Result<Notification, MalformedReason>
where
    R: PathResolver + ?Sized,
{
    // The descriptor is released here, before anything else can fail
    let fd_path = if header.fd >= 0 {
        resolver.resolve_fd(header.fd)
    } else {
        None
    };

    let mask = EventMask::from_bits_truncate(header.mask);
    if mask.contains(EventMask::QUEUE_OVERFLOW) {
        return Ok(Notification::Overflow { detected_at: now });
    }

    let refs = parse_info(&event[header.metadata_len..])?;
    let subject_path = fd_path.unwrap_or_else(|| resolve_refs(&refs, resolver));

    let subject_pid = (header.pid > 0).then_some(header.pid as u32);
    let record = EventRecord {
        timestamp: now,
        mask: mask.difference(EventMask::recursive_flags()),
        subject_path,
        subject_pid,
        process: subject_pid.and_then(|pid| resolver.process_info(pid)),
        is_directory: mask.contains(EventMask::ONDIR),
    };
    debug!(
        mask = %record.mask,
        path = %record.subject_path.display(),
        "Decoded event"
    );
    Ok(Notification::Event(record))
}

/// Close the descriptors of the records following a rejected one. The walk
/// stops at the first record it cannot frame. Returns how many were closed.
fn release_tail<R>(mut tail: &[u8], resolver: &R, limits: &DecodeLimits) -> usize
where
    R: PathResolver + ?Sized,
{
    let mut released = 0;
    while tail.len() >= FAN_EVENT_METADATA_LEN {
        let header = match Header::parse(tail, limits) {
            Ok(header) if header.event_len <= tail.len() => header,
            _ => break,
        };
        if header.fd >= 0 {
            resolver.release_fd(header.fd);
            released += 1;
        }
        tail = &tail[header.event_len..];
    }
    released
}

fn parse_info(bytes: &[u8]) -> Result<InfoRefs<'_>, MalformedReason> {
    let mut refs = InfoRefs::default();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes.len() - pos < FAN_EVENT_INFO_HEADER_LEN {
            return Err(MalformedReason::InfoOverrun(pos));
        }
        let info_type = bytes[pos];
        let len = read_u16(bytes, pos + 2) as usize;
        if len < FAN_EVENT_INFO_HEADER_LEN || len > bytes.len() - pos {
            return Err(MalformedReason::InfoOverrun(pos));
        }

        let body = &bytes[pos + FAN_EVENT_INFO_HEADER_LEN..pos + len];
        match info_type {
            FAN_EVENT_INFO_TYPE_FID => refs.object = Some(parse_fid(body)?.0),
            FAN_EVENT_INFO_TYPE_DFID => refs.dir = Some(parse_fid(body)?.0),
            FAN_EVENT_INFO_TYPE_DFID_NAME => {
                let (handle, tail) = parse_fid(body)?;
                refs.dir = Some(handle);
                let name = tail.split(|&b| b == 0).next().unwrap_or_default();
                refs.name = (!name.is_empty()).then_some(name);
            }
            // pidfd, error and rename-pair infos are not requested
            _ => {}
        }

        pos += len;
    }

    Ok(refs)
}

fn parse_fid(body: &[u8]) -> Result<(FileHandle<'_>, &[u8]), MalformedReason> {
    if body.len() < FID_FIXED_LEN {
        return Err(MalformedReason::HandleOverrun(0));
    }
    let handle_bytes = read_u32(body, 8) as usize;
    let end = FID_FIXED_LEN
        .checked_add(handle_bytes)
        .filter(|&end| end <= body.len())
        .ok_or(MalformedReason::HandleOverrun(handle_bytes))?;

    let handle = FileHandle {
        fsid: [read_i32(body, 0), read_i32(body, 4)],
        handle_type: read_i32(body, 12),
        bytes: &body[FID_FIXED_LEN..end],
    };
    Ok((handle, &body[end..]))
}

fn resolve_refs<R>(refs: &InfoRefs<'_>, resolver: &R) -> PathBuf
where
    R: PathResolver + ?Sized,
{
    let name = refs.name.map(OsStr::from_bytes);

    if let Some(dir) = &refs.dir {
        let base = resolver.resolve_handle(dir);
        return match (base, name) {
            (Some(base), Some(name)) if name != "." => base.join(name),
            (Some(base), _) => base,
            (None, Some(name)) => PathBuf::from(UNRESOLVED_PATH).join(name),
            (None, None) => PathBuf::from(UNRESOLVED_PATH),
        };
    }

    refs.object
        .as_ref()
        .and_then(|object| resolver.resolve_handle(object))
        .unwrap_or_else(|| PathBuf::from(UNRESOLVED_PATH))
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    read_u32(buf, at) as i32
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(word)
}
