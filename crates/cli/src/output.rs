//! Terminal formatting

use chrono::{DateTime, Utc};
use fanwatch_core::{Action, ActionKind};
use owo_colors::OwoColorize;

/// Colored action label
pub fn format_kind(kind: ActionKind) -> String {
    match kind {
        ActionKind::Log => format!("{}", "LOG  ".dimmed()),
        ActionKind::Alert => format!("{}", "ALERT".yellow().bold()),
        ActionKind::Deny => format!("{}", "DENY ".red().bold()),
    }
}

/// One line per action:
/// `14:30:01 ALERT /tmp/x [create] sh[42] alice (exec-from-temp: reason)`
///
/// Falls back to `pid 42` when the process had exited before decoding.
pub fn format_action(action: &Action) -> String {
    let record = &action.record;
    let time = record.timestamp.format("%H:%M:%S");

    if record.is_overflow() {
        return format!(
            "{} {} {}",
            time.dimmed(),
            format_kind(action.kind),
            action.reason.yellow()
        );
    }

    let mut line = format!(
        "{} {} {} {}",
        time.dimmed(),
        format_kind(action.kind),
        record.path().display().bold(),
        format!("[{}]", record.mask).cyan()
    );
    match (&record.process, record.subject_pid) {
        (Some(process), _) => line.push_str(&format!(" {}", process.to_string().dimmed())),
        (None, Some(pid)) => line.push_str(&format!(" {}", format!("pid {}", pid).dimmed())),
        (None, None) => {}
    }
    match &action.rule {
        Some(rule) => line.push_str(&format!(" ({}: {})", rule.cyan(), action.reason)),
        None if action.kind != ActionKind::Log => line.push_str(&format!(" ({})", action.reason)),
        None => {}
    }
    line
}

/// "2 hours ago"
pub fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds();
    if seconds < 0 {
        return "in the future".to_string();
    }

    if seconds < 60 {
        format!("{} seconds ago", seconds)
    } else if seconds < 3600 {
        format!("{} minutes ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{} hours ago", seconds / 3600)
    } else if seconds < 604800 {
        format!("{} days ago", seconds / 86400)
    } else {
        format!("{} weeks ago", seconds / 604800)
    }
}

/// "2024-01-03 14:30:00"
pub fn format_absolute_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fanwatch_core::{EventMask, EventRecord, ProcessInfo};

    #[test]
    fn test_format_action_mentions_rule_and_pid() {
        let action = Action::new(
            ActionKind::Alert,
            EventRecord::new(EventMask::EXEC, "/tmp/payload").with_pid(4242),
            "executed from temp",
        )
        .with_rule("exec-from-temp");

        let line = format_action(&action);
        assert!(line.contains("/tmp/payload"));
        assert!(line.contains("4242"));
        assert!(line.contains("exec-from-temp"));
        assert!(line.contains("executed from temp"));
    }

    #[test]
    fn test_format_action_names_process() {
        let process = ProcessInfo::parse_status(77, "Name:\tcurl\nUid:\t1000\t1000\t1000\t1000\n")
            .with_username(Some("alice".to_string()));
        let action = Action::new(
            ActionKind::Deny,
            EventRecord::new(EventMask::MODIFY, "/etc/shadow").with_process(process),
            "credential store written",
        );

        let line = format_action(&action);
        assert!(line.contains("curl[77]"));
        assert!(line.contains("alice"));
        assert!(!line.contains("pid 77"));
    }

    #[test]
    fn test_format_overflow() {
        let line = format_action(&Action::overflow(Utc::now()));
        assert!(line.contains("overflow"));
    }

    #[test]
    fn test_relative_time() {
        let now = Utc::now();
        assert_eq!(format_relative_time(now - Duration::seconds(5), now), "5 seconds ago");
        assert_eq!(format_relative_time(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(format_relative_time(now - Duration::days(15), now), "2 weeks ago");
        assert_eq!(format_relative_time(now + Duration::hours(1), now), "in the future");
    }
}
