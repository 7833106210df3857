//! Built-in rule presets

use crate::rule::{PathRule, Rule, RuleError};
use fanwatch_core::{ActionKind, EventMask};

/// Directories any user can write to
pub const WORLD_WRITABLE_DIRS: &[&str] = &["/tmp/", "/var/tmp/", "/dev/shm/"];

/// Files holding password hashes or privilege grants
pub const CREDENTIAL_STORES: &[&str] = &["/etc/shadow", "/etc/gshadow", "/etc/sudoers", "/etc/sudoers.d/"];

/// Account and remote-login configuration
pub const AUTH_CONFIG: &[&str] = &["/etc/passwd", "/etc/group", "authorized_keys"];

fn write_events() -> EventMask {
    EventMask::content()
        .union(EventMask::ATTRIB)
        .union(EventMask::directory_entries())
}

/// Preset rules, highest priority first
pub fn default_rules() -> Result<Vec<Box<dyn Rule>>, RuleError> {
    let credential_write = PathRule::builder("credential-store-write")
        .priority(0)
        .patterns(CREDENTIAL_STORES.iter().copied())
        .events(write_events())
        .action(ActionKind::Deny)
        .reason("write to credential store")
        .build()?;

    let temp_exec = PathRule::builder("exec-from-temp")
        .priority(10)
        .patterns(WORLD_WRITABLE_DIRS.iter().copied())
        .events(EventMask::EXEC)
        .directories(false)
        .action(ActionKind::Alert)
        .reason("executable launched from a world-writable directory")
        .build()?;

    let auth_change = PathRule::builder("auth-config-change")
        .priority(20)
        .patterns(AUTH_CONFIG.iter().copied())
        .events(write_events())
        .action(ActionKind::Alert)
        .reason("account or authentication configuration changed")
        .build()?;

    Ok(vec![
        Box::new(credential_write),
        Box::new(temp_exec),
        Box::new(auth_change),
    ])
}
