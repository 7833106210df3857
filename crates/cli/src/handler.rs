//! Action handlers at the process boundary

use crate::output::format_action;
use anyhow::{Context, Result};
use chrono::Utc;
use fanwatch_core::{Action, ActionKind};
use journal::{ActionJournal, Pruner, RetentionPolicy};
use policy::ActionHandler;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Emits every action as a structured log line
#[derive(Debug, Default)]
pub struct TracingHandler;

impl ActionHandler for TracingHandler {
    fn handle(&mut self, action: &Action) -> Result<()> {
        let record = &action.record;
        let rule = action.rule.as_deref().unwrap_or("-");
        let process = record.process.as_ref().map(ToString::to_string);
        let process = process.as_deref().unwrap_or("-");
        let uid = record.process.as_ref().and_then(|process| process.uid);
        let cmdline = record
            .process
            .as_ref()
            .and_then(|process| process.cmdline.as_deref())
            .unwrap_or("-");

        match action.kind {
            ActionKind::Log => debug!(
                path = %record.path().display(),
                mask = %record.mask,
                pid = ?record.subject_pid,
                process,
                "File activity"
            ),
            ActionKind::Alert => warn!(
                path = %record.path().display(),
                mask = %record.mask,
                pid = ?record.subject_pid,
                process,
                uid = ?uid,
                cmdline,
                rule,
                reason = %action.reason,
                "ALERT"
            ),
            ActionKind::Deny => error!(
                path = %record.path().display(),
                mask = %record.mask,
                pid = ?record.subject_pid,
                process,
                uid = ?uid,
                cmdline,
                rule,
                reason = %action.reason,
                "DENY"
            ),
        }
        Ok(())
    }
}

/// Prints actions to a terminal
pub struct ConsoleHandler<W: Write + Send> {
    out: W,
    /// Also print `Log` actions
    verbose: bool,
}

impl ConsoleHandler<std::io::Stdout> {
    pub fn stdout(verbose: bool) -> Self {
        Self::new(std::io::stdout(), verbose)
    }
}

impl<W: Write + Send> ConsoleHandler<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self { out, verbose }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ActionHandler for ConsoleHandler<W> {
    fn handle(&mut self, action: &Action) -> Result<()> {
        if action.kind == ActionKind::Log && !self.verbose {
            return Ok(());
        }
        writeln!(self.out, "{}", format_action(action)).context("Failed to write action")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush output")
    }
}

/// Archives alerts and denials
pub struct JournalHandler {
    journal: ActionJournal,
    pruner: Pruner,
    appended: u64,
}

impl JournalHandler {
    /// Prune every this many appends
    const PRUNE_EVERY: u64 = 1024;

    pub fn open(dir: &Path, retention: RetentionPolicy) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create journal directory {}", dir.display()))?;
        let journal = ActionJournal::open(dir)?;

        Ok(Self {
            journal,
            pruner: Pruner::new(retention),
            appended: 0,
        })
    }

    pub fn journal(&self) -> &ActionJournal {
        &self.journal
    }
}

impl ActionHandler for JournalHandler {
    fn handle(&mut self, action: &Action) -> Result<()> {
        if action.kind == ActionKind::Log {
            return Ok(());
        }

        self.journal.append(action)?;
        self.appended += 1;
        if self.appended % Self::PRUNE_EVERY == 0 {
            self.pruner.prune(&self.journal, Utc::now())?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let report = self.pruner.prune(&self.journal, Utc::now())?;
        self.journal.flush()?;
        info!(
            appended = self.appended,
            kept = report.kept,
            "Action journal flushed"
        );
        Ok(())
    }
}
