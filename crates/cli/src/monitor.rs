//! Monitor wiring
//!
//! Three named threads connected by bounded channels:
//!
//! ```text
//! dispatch --Notification--> engine --Action--> consumer (handlers)
//! ```
//!
//! Stopping the dispatch loop closes the first channel, which ends the engine,
//! which closes the sink, which ends the consumer. Each stage drains what is
//! already queued before it exits.

use crate::config::MonitorConfig;
use anyhow::{Context, Result};
use fanwatch_core::{EventMask, MarkError, SourceError};
use policy::{drain, ActionHandler, DrainStats, EngineStats, SinkClosed};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use watcher::{DispatchError, DispatchLoop, DispatchStats, EventSource, StopHandle, WatchRegistry};

/// Counters from a finished monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub dispatch: DispatchStats,
    pub engine: EngineStats,
    pub drain: DrainStats,
    /// Actions evicted from a full drop-oldest sink
    pub dropped_actions: u64,
}

/// Register every watch, logging each failure
///
/// Returns the failures; the watches that succeeded stay registered.
pub fn register_watches<S: EventSource>(
    registry: &WatchRegistry<S>,
    watches: &[(PathBuf, EventMask, bool)],
) -> Vec<(PathBuf, MarkError)> {
    let mut failures = Vec::new();

    for (path, mask, recursive) in watches {
        if let Err(err) = registry.add_watch(path, *mask, *recursive) {
            error!(path = %path.display(), mask = %mask, error = %err, "Failed to add watch");
            failures.push((path.clone(), err));
        }
    }

    info!(
        active = registry.list_active().len(),
        failed = failures.len(),
        "Watches registered"
    );
    failures
}

/// A running monitor
pub struct RunningMonitor<S: EventSource + 'static> {
    registry: Arc<WatchRegistry<S>>,
    stop: StopHandle,
    failed_watches: Vec<(PathBuf, MarkError)>,
    dispatch: JoinHandle<Result<DispatchStats, DispatchError>>,
    engine: JoinHandle<(Result<EngineStats, SinkClosed>, u64)>,
    consumer: JoinHandle<DrainStats>,
}

/// Register the configured watches on `source` and start monitoring
///
/// Fails if no watch could be registered.
pub fn start<S: EventSource + 'static>(
    source: S,
    config: &MonitorConfig,
    mut handlers: Vec<Box<dyn ActionHandler>>,
) -> Result<RunningMonitor<S>> {
    let engine = config.build_engine()?;
    let watches = config.watch_specs()?;

    let registry = Arc::new(WatchRegistry::new(source));
    let failed_watches = register_watches(&registry, &watches);
    if registry.list_active().is_empty() {
        registry.teardown();
        anyhow::bail!(
            "No watch could be registered ({} of {} failed)",
            failed_watches.len(),
            watches.len()
        );
    }

    let (tx, rx) = crossbeam_channel::bounded(config.monitor.channel_capacity.max(1));
    let (sink, actions) = policy::channel(config.sink.capacity, config.sink.overflow);

    // Spawned back to front so a failed spawn still unwinds the chain
    let consumer = thread::Builder::new()
        .name("fanwatch-consumer".to_string())
        .spawn(move || drain(&actions, &mut handlers))
        .context("Failed to spawn consumer thread")?;

    let engine = thread::Builder::new()
        .name("fanwatch-engine".to_string())
        .spawn(move || {
            let result = engine.run(&rx, &sink);
            (result, sink.dropped())
        })
        .context("Failed to spawn engine thread")?;

    let mut dispatch = DispatchLoop::new(registry.source(), config.dispatch_config())
        .with_reconciler(Arc::clone(&registry), config.reconcile_interval());
    let stop = dispatch.stop_handle();
    let dispatch = thread::Builder::new()
        .name("fanwatch-dispatch".to_string())
        .spawn(move || dispatch.run(&tx))
        .context("Failed to spawn dispatch thread")?;

    Ok(RunningMonitor {
        registry,
        stop,
        failed_watches,
        dispatch,
        engine,
        consumer,
    })
}

impl<S: EventSource + 'static> RunningMonitor<S> {
    /// Handle for requesting a stop from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Live watch registry; changes apply on the next poll cycle
    pub fn registry(&self) -> &Arc<WatchRegistry<S>> {
        &self.registry
    }

    /// Watches that failed at startup
    pub fn failed_watches(&self) -> &[(PathBuf, MarkError)] {
        &self.failed_watches
    }

    /// Request a stop and wait for every stage to drain
    pub fn shutdown(self) -> Result<MonitorReport> {
        self.stop.stop();
        self.wait()
    }

    /// Wait for the monitor to end, then tear down the watch set
    pub fn wait(self) -> Result<MonitorReport> {
        let dispatch = join(self.dispatch, "dispatch")?;
        let (engine, dropped_actions) = join(self.engine, "engine")?;
        let drain = join(self.consumer, "consumer")?;
        self.registry.teardown();

        if dropped_actions > 0 {
            warn!(dropped = dropped_actions, "Actions were dropped by a full sink");
        }

        let report = MonitorReport {
            dispatch: dispatch.context("Monitoring stopped")?,
            engine: engine.context("Decision engine stopped")?,
            drain,
            dropped_actions,
        };
        info!(
            events = report.dispatch.events,
            actions = report.drain.handled,
            "Monitor stopped"
        );
        Ok(report)
    }
}

fn join<T>(handle: JoinHandle<T>, stage: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("{} thread panicked", stage))
}

/// Process exit code for a failed run
pub fn exit_code(err: &anyhow::Error) -> u8 {
    let unavailable = err
        .chain()
        .any(|cause| cause.downcast_ref::<SourceError>().is_some());
    if unavailable {
        2
    } else {
        1
    }
}
