//! fanotify ABI constants
//!
//! Values from `include/uapi/linux/fanotify.h`. Event bits live on
//! `fanwatch_core::EventMask`.

// fanotify_init() flags
pub const FAN_CLOEXEC: u32 = 0x0000_0001;
pub const FAN_NONBLOCK: u32 = 0x0000_0002;
pub const FAN_CLASS_NOTIF: u32 = 0x0000_0000;
pub const FAN_UNLIMITED_QUEUE: u32 = 0x0000_0010;
pub const FAN_UNLIMITED_MARKS: u32 = 0x0000_0020;
pub const FAN_REPORT_FID: u32 = 0x0000_0200;
pub const FAN_REPORT_DIR_FID: u32 = 0x0000_0400;
pub const FAN_REPORT_NAME: u32 = 0x0000_0800;
pub const FAN_REPORT_DFID_NAME: u32 = FAN_REPORT_DIR_FID | FAN_REPORT_NAME;

/// Notification-only group, non-blocking reads, no queue or mark limits
pub const INIT_FLAGS: u32 =
    FAN_CLASS_NOTIF | FAN_NONBLOCK | FAN_CLOEXEC | FAN_UNLIMITED_QUEUE | FAN_UNLIMITED_MARKS;

// fanotify_mark() flags
pub const FAN_MARK_ADD: u32 = 0x0000_0001;
pub const FAN_MARK_REMOVE: u32 = 0x0000_0002;

// struct fanotify_event_metadata
pub const FANOTIFY_METADATA_VERSION: u8 = 3;
pub const FAN_EVENT_METADATA_LEN: usize = 24;
pub const FAN_NOFD: i32 = -1;

// struct fanotify_event_info_header
pub const FAN_EVENT_INFO_HEADER_LEN: usize = 4;
pub const FAN_EVENT_INFO_TYPE_FID: u8 = 1;
pub const FAN_EVENT_INFO_TYPE_DFID_NAME: u8 = 2;
pub const FAN_EVENT_INFO_TYPE_DFID: u8 = 3;

/// fsid (2 x i32) + handle_bytes (u32) + handle_type (i32)
pub const FID_FIXED_LEN: usize = 16;
