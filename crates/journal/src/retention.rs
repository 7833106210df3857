//! Retention policies and pruning

use crate::{ActionJournal, Result};
use chrono::{DateTime, Utc};
use tracing::info;
use ulid::Ulid;

/// Retention policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Number of entries to keep (default: 10000)
    pub retain_count: usize,
    /// Drop entries older than this many seconds regardless of count
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retain_count: 10_000,
            max_age_secs: None,
        }
    }
}

/// Result of a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub kept: usize,
}

/// Applies a retention policy to a journal
pub struct Pruner {
    policy: RetentionPolicy,
}

impl Pruner {
    /// Create a new pruner with the given policy
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Entries the policy no longer retains, oldest first
    pub fn collect(&self, journal: &ActionJournal, now: DateTime<Utc>) -> Vec<Ulid> {
        let ids = journal.ids();
        let over_count = ids.len().saturating_sub(self.policy.retain_count);

        let cutoff_ms = self.policy.max_age_secs.map(|secs| {
            let cutoff = now.timestamp_millis() - (secs as i64).saturating_mul(1000);
            cutoff.max(0) as u64
        });

        ids.into_iter()
            .enumerate()
            .filter(|(pos, id)| {
                *pos < over_count || cutoff_ms.map_or(false, |cutoff| id.timestamp_ms() < cutoff)
            })
            .map(|(_, id)| id)
            .collect()
    }

    /// Delete every entry the policy no longer retains
    pub fn prune(&self, journal: &ActionJournal, now: DateTime<Utc>) -> Result<PruneReport> {
        let expired = self.collect(journal, now);
        for id in &expired {
            journal.delete(id)?;
        }

        let report = PruneReport {
            removed: expired.len(),
            kept: journal.count(),
        };
        if report.removed > 0 {
            info!(removed = report.removed, kept = report.kept, "Pruned action journal");
        }
        Ok(report)
    }
}
