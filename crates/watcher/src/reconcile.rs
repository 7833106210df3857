//! Periodic watch-set reconciliation
//!
//! The kernel silently drops a mark when its inode goes away, and a
//! recursive watch only covers the sub-directories that existed when it was
//! marked. The dispatch loop runs a reconciliation pass on idle poll
//! timeouts to catch both.

use crate::registry::WatchRegistry;
use crate::source::EventSource;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active entries examined
    pub checked: usize,
    /// Entries whose path is gone
    pub deactivated: usize,
    /// Recursive entries re-marked
    pub refreshed: usize,
    /// Marks that could not be refreshed or cleared
    pub failed: usize,
}

impl<S: EventSource> WatchRegistry<S> {
    /// Deactivate watches on vanished paths and re-expand recursive ones
    pub fn reconcile(&self) -> ReconcileReport {
        let report = self.with_locked(|source, entries| {
            let mut report = ReconcileReport::default();

            for entry in entries.values_mut().filter(|entry| entry.active) {
                report.checked += 1;

                if !entry.path.exists() {
                    warn!(path = %entry.path.display(), wd = %entry.descriptor, "Watched path disappeared");
                    entry.active = false;
                    // Clears the adapter's mark table; the kernel mark is already gone
                    if let Err(err) = source.unmark(&entry.path) {
                        warn!(
                            path = %entry.path.display(),
                            error = %err,
                            "Failed to clear mark of vanished path"
                        );
                        report.failed += 1;
                    }
                    report.deactivated += 1;
                    continue;
                }

                if !entry.recursive {
                    continue;
                }

                match source.mark(&entry.path, entry.mask, true) {
                    Ok(()) => report.refreshed += 1,
                    Err(err) if err.is_not_found() => {
                        warn!(path = %entry.path.display(), "Watched path disappeared");
                        entry.active = false;
                        report.deactivated += 1;
                    }
                    Err(err) => {
                        warn!(path = %entry.path.display(), error = %err, "Failed to refresh recursive watch");
                        report.failed += 1;
                    }
                }
            }

            report
        });

        debug!(
            checked = report.checked,
            deactivated = report.deactivated,
            refreshed = report.refreshed,
            failed = report.failed,
            "Reconciliation pass finished"
        );
        report
    }
}

/// Rate limiter for reconciliation passes
#[derive(Debug, Clone)]
pub struct Reconciler {
    interval: Duration,
    last_run: Instant,
}

impl Reconciler {
    /// Run at most once per `interval`; the first pass is one interval
    /// after creation
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a pass is due at `now`
    pub fn due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_run) >= self.interval
    }

    /// Run a pass if one is due
    pub fn run_if_due<S: EventSource>(&mut self, registry: &WatchRegistry<S>) -> Option<ReconcileReport> {
        let now = Instant::now();
        if !self.due(now) {
            return None;
        }
        self.last_run = now;

        let report = registry.reconcile();
        if report.deactivated > 0 || report.failed > 0 {
            info!(
                deactivated = report.deactivated,
                failed = report.failed,
                "Reconciliation changed the watch set"
            );
        }
        Some(report)
    }
}
