//! Run the monitor until interrupted

use anyhow::{Context, Result};
use cli_lib::{monitor, ConsoleHandler, JournalHandler, MonitorConfig, MonitorReport, TracingHandler};
use owo_colors::OwoColorize;
use policy::ActionHandler;
use fanwatch_core::MarkError;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use watcher::EventSource;

pub async fn run(config: MonitorConfig, verbose: bool) -> Result<()> {
    let source = open_source()?;
    monitor_until_signal(source, config, verbose).await
}

#[cfg(target_os = "linux")]
fn open_source() -> Result<watcher::FanotifySource> {
    let source = watcher::FanotifySource::open(&watcher::SourceOptions::default())
        .context("Failed to open event source")?;
    Ok(source)
}

#[cfg(not(target_os = "linux"))]
fn open_source() -> Result<watcher::scripted::ScriptedSource> {
    Err(fanwatch_core::SourceError::unavailable(
        "fanotify is only available on Linux",
    ))
    .context("Failed to open event source")
}

async fn monitor_until_signal<S: EventSource + 'static>(
    source: S,
    config: MonitorConfig,
    verbose: bool,
) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let mut handlers: Vec<Box<dyn ActionHandler>> = vec![
        Box::new(TracingHandler),
        Box::new(ConsoleHandler::stdout(verbose)),
    ];
    if config.journal.enabled {
        if let Some(dir) = &config.journal.path {
            handlers.push(Box::new(JournalHandler::open(dir, config.retention())?));
        }
    }

    let running = monitor::start(source, &config, handlers)?;
    print_startup(running.registry().list_active().len(), running.failed_watches());

    let stop = running.stop_handle();
    let mut waiter = tokio::task::spawn_blocking(move || running.wait());

    let report = tokio::select! {
        joined = &mut waiter => joined.context("Monitor task failed")??,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            stop.stop();
            waiter.await.context("Monitor task failed")??
        }
        _ = terminate.recv() => {
            info!("SIGTERM received, shutting down");
            stop.stop();
            waiter.await.context("Monitor task failed")??
        }
    };

    print_report(&report);
    Ok(())
}

fn print_startup(active: usize, failed: &[(PathBuf, MarkError)]) {
    println!(
        "{} Watching {} path{}",
        "✓".green(),
        active.to_string().bold(),
        if active == 1 { "" } else { "s" }
    );
    for (path, err) in failed {
        println!("  {} {}: {}", "✗".red(), path.display(), err.to_string().dimmed());
    }
    println!("{}", "Press Ctrl-C to stop".dimmed());
}

fn print_report(report: &MonitorReport) {
    println!();
    println!("{}", "Monitor stopped".bold());
    println!("  Events:     {}", report.dispatch.events);
    println!("  Alerts:     {}", report.engine.alerts.to_string().yellow());
    println!("  Denials:    {}", report.engine.denials.to_string().red());
    if report.dispatch.overflows > 0 {
        println!("  Overflows:  {}", report.dispatch.overflows.to_string().yellow());
    }
    if report.dispatch.malformed > 0 {
        println!("  Malformed:  {}", report.dispatch.malformed.to_string().yellow());
    }
    if report.dropped_actions > 0 {
        println!("  Dropped:    {}", report.dropped_actions.to_string().yellow());
    }
}
