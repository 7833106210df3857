//! Decision engine
//!
//! Turns every notification into exactly one action. Rules are consulted in
//! priority order and the first match wins; records nothing matches are
//! logged as unclassified, and overflows always raise an alert.

use crate::rule::Rule;
use crate::sink::{ActionSender, SinkClosed};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use fanwatch_core::{Action, ActionKind, EventRecord, Notification};
use tracing::{debug, info, warn};

/// Counters from `Engine::run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub processed: u64,
    pub logged: u64,
    pub alerts: u64,
    pub denials: u64,
    pub overflows: u64,
}

impl EngineStats {
    fn record(&mut self, action: &Action) {
        self.processed += 1;
        match action.kind {
            ActionKind::Log => self.logged += 1,
            ActionKind::Alert => self.alerts += 1,
            ActionKind::Deny => self.denials += 1,
        }
        if action.record.is_overflow() {
            self.overflows += 1;
        }
    }
}

/// Ordered rule set
pub struct Engine {
    rules: Vec<Box<dyn Rule>>,
}

impl Engine {
    /// Order `rules` by priority; equal priorities keep their given order
    pub fn new(mut rules: Vec<Box<dyn Rule>>) -> Self {
        rules.sort_by_key(|rule| rule.priority());
        Self { rules }
    }

    /// Rule names in evaluation order
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify one record
    pub fn classify(&self, record: &EventRecord) -> Action {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(record))
            .unwrap_or_else(|| Action::unclassified(record.clone()))
    }

    /// Alert for a queue overflow
    pub fn classify_overflow(&self, detected_at: DateTime<Utc>) -> Action {
        Action::overflow(detected_at)
    }

    /// Classify one notification
    pub fn process(&self, notification: Notification) -> Action {
        match notification {
            Notification::Event(record) => self.classify(&record),
            Notification::Overflow { detected_at } => self.classify_overflow(detected_at),
        }
    }

    /// Classify notifications in arrival order until the channel
    /// disconnects
    pub fn run(&self, rx: &Receiver<Notification>, sink: &ActionSender) -> Result<EngineStats, SinkClosed> {
        info!(rules = self.rules.len(), "Decision engine started");
        let mut stats = EngineStats::default();

        for notification in rx.iter() {
            let action = self.process(notification);
            stats.record(&action);

            match action.kind {
                ActionKind::Log => debug!(
                    path = %action.record.path().display(),
                    mask = %action.record.mask,
                    reason = %action.reason,
                    "Classified"
                ),
                _ => warn!(
                    kind = %action.kind,
                    path = %action.record.path().display(),
                    rule = action.rule.as_deref().unwrap_or("-"),
                    reason = %action.reason,
                    "Classified"
                ),
            }

            sink.send(action)?;
        }

        info!(
            processed = stats.processed,
            alerts = stats.alerts,
            denials = stats.denials,
            "Decision engine stopped"
        );
        Ok(stats)
    }
}
