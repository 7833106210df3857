//! Policy decisions handed to the action sink

use crate::EventRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reason attached to records no rule matched
pub const UNCLASSIFIED_REASON: &str = "unclassified";

/// Reason attached to overflow alerts
pub const OVERFLOW_REASON: &str = "event queue overflow: possible gap in monitoring coverage";

/// What downstream should do with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Record for audit
    Log,
    /// Notify an operator
    Alert,
    /// Block token for an enforcing collaborator
    Deny,
}

impl ActionKind {
    /// Lowercase name, as used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Alert => "alert",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "alert" => Ok(Self::Alert),
            "deny" | "block" => Ok(Self::Deny),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Classification result for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Decision
    pub kind: ActionKind,
    /// Record the decision applies to
    pub record: EventRecord,
    /// Human-readable explanation
    pub reason: String,
    /// Name of the rule that produced this action, if any
    pub rule: Option<String>,
}

impl Action {
    /// Create an action not attributed to a rule
    pub fn new(kind: ActionKind, record: EventRecord, reason: impl Into<String>) -> Self {
        Self {
            kind,
            record,
            reason: reason.into(),
            rule: None,
        }
    }

    /// Attribute the action to a rule
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Default action for a record no rule matched
    pub fn unclassified(record: EventRecord) -> Self {
        Self::new(ActionKind::Log, record, UNCLASSIFIED_REASON)
    }

    /// Alert raised for a kernel queue overflow
    pub fn overflow(detected_at: DateTime<Utc>) -> Self {
        Self::new(
            ActionKind::Alert,
            EventRecord::overflow(detected_at),
            OVERFLOW_REASON,
        )
    }
}
