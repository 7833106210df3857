//! List archived actions

use anyhow::{Context, Result};
use chrono::Utc;
use cli_lib::output::{format_absolute_time, format_kind, format_relative_time};
use cli_lib::MonitorConfig;
use journal::{ActionJournal, Pruner};
use owo_colors::OwoColorize;

pub async fn run(config: MonitorConfig, limit: usize, prune: bool) -> Result<()> {
    let dir = match &config.journal.path {
        Some(dir) if config.journal.enabled => dir,
        _ => anyhow::bail!("Journal is disabled in this config ([journal] enabled = false)"),
    };
    if !dir.exists() {
        anyhow::bail!("No journal at {} (has the monitor run yet?)", dir.display());
    }

    let journal = ActionJournal::open(dir)
        .with_context(|| format!("Failed to open journal at {}", dir.display()))?;

    if prune {
        let report = Pruner::new(config.retention()).prune(&journal, Utc::now())?;
        journal.flush()?;
        println!(
            "{} Pruned {} entries, {} kept",
            "✓".green(),
            report.removed,
            report.kept
        );
        return Ok(());
    }

    let entries = journal.last_n(limit)?;
    if entries.is_empty() {
        println!("{}", "No archived actions".dimmed());
        return Ok(());
    }

    println!(
        "{} (showing {} of {})",
        "Archived actions".bold(),
        entries.len(),
        journal.count()
    );
    println!();

    let now = Utc::now();
    // Newest first
    for entry in entries.iter().rev() {
        let action = &entry.action;
        let appended = entry.appended_at();
        println!(
            "{} {} {}",
            entry.id.to_string().yellow(),
            format_kind(action.kind),
            format_absolute_time(appended).dimmed()
        );
        if action.record.is_overflow() {
            println!("    {}", action.reason);
        } else {
            println!(
                "    {} [{}]",
                action.record.path().display().bold(),
                action.record.mask.to_string().cyan()
            );
            let rule = action.rule.as_deref().unwrap_or("-");
            println!("    {} {}", rule.cyan(), action.reason);
            if let Some(process) = &action.record.process {
                println!("    by {}", process);
                if let Some(cmdline) = &process.cmdline {
                    println!("    {}", cmdline.dimmed());
                }
            }
        }
        println!("    {}", format_relative_time(appended, now).dimmed());
    }

    Ok(())
}
