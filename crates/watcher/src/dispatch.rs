//! Dispatch loop
//!
//! One dedicated thread waits for the event source to become readable,
//! drains it, decodes each buffer and forwards the notifications in order
//! over a bounded channel. A full channel blocks the loop, which in turn
//! leaves events queued in the kernel.
//!
//! ```text
//! Idle -> Waiting -> Draining -> Idle
//!           |           |
//!           +-> Error <-+
//! ```

use crate::decode::{DecodeLimits, Decoder, MalformedRecord};
use crate::reconcile::Reconciler;
use crate::registry::{SharedSource, WatchRegistry};
use crate::resolve::PathResolver;
use crate::source::{EventSource, ReadOutcome, Readiness};
use crossbeam_channel::Sender;
use fanwatch_core::Notification;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Waiting = 1,
    Draining = 2,
    Error = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Waiting,
            2 => Self::Draining,
            3 => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// Loop tuning
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Upper bound on one wait; idle timeouts run housekeeping
    pub poll_timeout: Duration,
    /// Size of the read buffer
    pub read_buffer_size: usize,
    pub limits: DecodeLimits,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            read_buffer_size: 64 * 1024,
            limits: DecodeLimits::default(),
        }
    }
}

/// Conditions that end monitoring
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event source closed")]
    Closed,

    #[error("event source read failed: {0}")]
    Source(#[source] io::Error),

    #[error("waiting for events failed: {0}")]
    Wait(#[source] io::Error),

    #[error("notification receiver disconnected")]
    Disconnected,
}

/// Counters kept by the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub buffers: u64,
    pub bytes: u64,
    pub events: u64,
    pub overflows: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    state: AtomicU8,
}

/// Cooperative stop request, checked at iteration boundaries
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Ask the loop to finish after the buffer in hand
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Current state of the loop this handle belongs to
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }
}

/// Drains an event source into a notification channel
pub struct DispatchLoop<S: EventSource> {
    source: SharedSource<S>,
    config: DispatchConfig,
    handle: StopHandle,
    reconcile: Option<(Arc<WatchRegistry<S>>, Reconciler)>,
    stats: DispatchStats,
}

impl<S: EventSource> DispatchLoop<S> {
    pub fn new(source: SharedSource<S>, config: DispatchConfig) -> Self {
        Self {
            source,
            config,
            handle: StopHandle::default(),
            reconcile: None,
            stats: DispatchStats::default(),
        }
    }

    /// Reconcile `registry` on idle timeouts, at most once per `interval`
    pub fn with_reconciler(mut self, registry: Arc<WatchRegistry<S>>, interval: Duration) -> Self {
        self.reconcile = Some((registry, Reconciler::new(interval)));
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Run until stopped or until the source fails.
    ///
    /// The source is closed on every exit.
    pub fn run(&mut self, tx: &Sender<Notification>) -> Result<DispatchStats, DispatchError> {
        info!(
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            buffer = self.config.read_buffer_size,
            "Dispatch loop starting"
        );

        let result = self.run_inner(tx);
        self.source.lock().close();

        match &result {
            Ok(stats) => {
                self.set_state(LoopState::Idle);
                info!(
                    events = stats.events,
                    overflows = stats.overflows,
                    malformed = stats.malformed,
                    "Dispatch loop stopped"
                );
            }
            Err(err) => {
                self.set_state(LoopState::Error);
                error!(error = %err, events = self.stats.events, "Dispatch loop failed");
            }
        }
        result
    }

    fn run_inner(&mut self, tx: &Sender<Notification>) -> Result<DispatchStats, DispatchError> {
        let (resolver, capabilities) = {
            let source = self.source.lock();
            (source.resolver(), source.capabilities())
        };
        let limits = DecodeLimits {
            whole_records: capabilities.whole_records,
            ..self.config.limits
        };
        let mut decoder = Decoder::new(resolver, limits);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        loop {
            if self.handle.is_stopped() {
                return Ok(self.stats);
            }

            self.set_state(LoopState::Waiting);
            let readiness = self.source.lock().readiness();
            let ready = wait(readiness, self.config.poll_timeout)?;

            let mut idle = !ready;
            if ready {
                self.set_state(LoopState::Draining);
                let read_any = self.drain(&mut decoder, &mut buf, tx)?;
                if !read_any && readiness == Readiness::Always {
                    std::thread::sleep(self.config.poll_timeout);
                    idle = true;
                }
            }

            self.set_state(LoopState::Idle);
            if idle {
                self.housekeeping();
            }
        }
    }

    /// Read until the source would block. Returns whether anything was read.
    fn drain<R: PathResolver>(
        &mut self,
        decoder: &mut Decoder<R>,
        buf: &mut [u8],
        tx: &Sender<Notification>,
    ) -> Result<bool, DispatchError> {
        let mut read_any = false;

        loop {
            // Lock held for a single non-blocking read only
            let outcome = self.source.lock().read_raw(buf);

            match outcome {
                ReadOutcome::Data(n) => {
                    read_any = true;
                    self.stats.buffers += 1;
                    self.stats.bytes += n as u64;
                    self.process(decoder, &buf[..n], tx)?;
                }
                ReadOutcome::WouldBlock => return Ok(read_any),
                ReadOutcome::QueueOverflow => {
                    read_any = true;
                    self.forward(Notification::overflow(), tx)?;
                }
                ReadOutcome::Closed => return Err(DispatchError::Closed),
                ReadOutcome::Failed(err) => return Err(DispatchError::Source(err)),
            }

            if self.handle.is_stopped() {
                return Ok(read_any);
            }
        }
    }

    fn process<R: PathResolver>(
        &mut self,
        decoder: &mut Decoder<R>,
        bytes: &[u8],
        tx: &Sender<Notification>,
    ) -> Result<(), DispatchError> {
        match decoder.feed(bytes) {
            Ok(notifications) => {
                for notification in notifications {
                    self.forward(notification, tx)?;
                }
            }
            Err(MalformedRecord {
                offset,
                reason,
                salvaged,
            }) => {
                self.stats.malformed += 1;
                warn!(
                    offset,
                    reason = %reason,
                    salvaged = salvaged.len(),
                    "Discarding malformed event data"
                );
                for notification in salvaged {
                    self.forward(notification, tx)?;
                }
            }
        }
        Ok(())
    }

    fn forward(&mut self, notification: Notification, tx: &Sender<Notification>) -> Result<(), DispatchError> {
        if notification.is_overflow() {
            self.stats.overflows += 1;
            warn!("Kernel event queue overflowed, events were lost");
        } else {
            self.stats.events += 1;
        }
        tx.send(notification).map_err(|_| DispatchError::Disconnected)
    }

    fn housekeeping(&mut self) {
        if let Some((registry, reconciler)) = self.reconcile.as_mut() {
            if let Some(report) = reconciler.run_if_due(registry) {
                debug!(checked = report.checked, "Housekeeping done");
            }
        }
    }

    fn set_state(&self, state: LoopState) {
        self.handle.shared.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Wait for `readiness` up to `timeout`. Returns whether data may be
/// pending.
fn wait(readiness: Readiness, timeout: Duration) -> Result<bool, DispatchError> {
    let fd = match readiness {
        Readiness::Always => return Ok(true),
        Readiness::Fd(fd) => fd,
    };

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    // SAFETY: pollfd is a valid, exclusively borrowed array of one element
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(DispatchError::Wait(err));
    }

    // POLLERR/POLLHUP/POLLNVAL also count as ready so the read reports them
    Ok(rc > 0 && pollfd.revents != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{MapResolver, RawEventBuilder, ScriptEnd, ScriptedSource, Step};
    use crate::sys::FANOTIFY_METADATA_VERSION;
    use crossbeam_channel::bounded;
    use fanwatch_core::EventMask;
    use parking_lot::Mutex;
    use std::path::Path;

    fn config() -> DispatchConfig {
        DispatchConfig {
            poll_timeout: Duration::from_millis(5),
            ..DispatchConfig::default()
        }
    }

    fn resolver() -> MapResolver {
        MapResolver::new()
            .with_fd(20, "/data/b")
            .with_handle(b"dir-data", "/data")
            .with_handle(b"dir-tmp", "/tmp")
    }

    fn shared(source: ScriptedSource) -> SharedSource<ScriptedSource> {
        Arc::new(Mutex::new(source.with_resolver(resolver())))
    }

    fn paths(notifications: &[Notification]) -> Vec<String> {
        notifications
            .iter()
            .map(|n| match n {
                Notification::Event(record) => record.path().display().to_string(),
                Notification::Overflow { .. } => "<overflow>".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_overflow_forwarded_in_order() {
        let source = shared(
            ScriptedSource::new()
                .data(
                    RawEventBuilder::new()
                        .name_event(EventMask::CREATE, 1, b"dir-data", "a")
                        .build(),
                )
                .step(Step::Overflow)
                .data(RawEventBuilder::new().fd_event(EventMask::MODIFY, 20, 1).build()),
        );
        let (tx, rx) = bounded(16);

        let mut dispatch = DispatchLoop::new(Arc::clone(&source), config());
        let err = dispatch.run(&tx).unwrap_err();

        assert!(matches!(err, DispatchError::Closed));
        assert_eq!(dispatch.state(), LoopState::Error);
        let received: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(paths(&received), vec!["/data/a", "<overflow>", "/data/b"]);
        assert_eq!(dispatch.stats().overflows, 1);
        assert_eq!(dispatch.stats().events, 2);
        assert_eq!(source.lock().close_calls(), 1);
    }

    #[test]
    fn test_in_band_overflow_record() {
        let source = shared(
            ScriptedSource::new().data(
                RawEventBuilder::new()
                    .overflow()
                    .name_event(EventMask::CREATE, 1, b"dir-tmp", "x")
                    .build(),
            ),
        );
        let (tx, rx) = bounded(16);

        let _ = DispatchLoop::new(source, config()).run(&tx);

        let received: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(paths(&received), vec!["<overflow>", "/tmp/x"]);
    }

    #[test]
    fn test_malformed_buffer_does_not_stop_loop() {
        let mut bad = RawEventBuilder::new()
            .name_event(EventMask::CREATE, 1, b"dir-data", "first")
            .build();
        bad.extend(
            RawEventBuilder::new()
                .raw_metadata(8, FANOTIFY_METADATA_VERSION, 24, EventMask::MODIFY.bits(), -1, 1)
                .build(),
        );
        let source = shared(
            ScriptedSource::new()
                .data(bad)
                .data(
                    RawEventBuilder::new()
                        .name_event(EventMask::CREATE, 1, b"dir-data", "second")
                        .build(),
                ),
        );
        let (tx, rx) = bounded(16);

        let mut dispatch = DispatchLoop::new(source, config());
        let _ = dispatch.run(&tx);

        let received: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(paths(&received), vec!["/data/first", "/data/second"]);
        assert_eq!(dispatch.stats().malformed, 1);
    }

    #[test]
    fn test_overrunning_record_from_whole_record_source_is_dropped() {
        let corrupt = RawEventBuilder::new()
            .raw_metadata(200, FANOTIFY_METADATA_VERSION, 24, EventMask::MODIFY.bits(), -1, 1)
            .build();
        let source = shared(
            ScriptedSource::new()
                .whole_records()
                .data(corrupt)
                .data(RawEventBuilder::new().fd_event(EventMask::MODIFY, 20, 1).build()),
        );
        let (tx, rx) = bounded(16);

        let mut dispatch = DispatchLoop::new(source, config());
        let err = dispatch.run(&tx).unwrap_err();

        assert!(matches!(err, DispatchError::Closed));
        let received: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(paths(&received), vec!["/data/b"]);
        assert_eq!(dispatch.stats().malformed, 1);
        assert_eq!(dispatch.stats().events, 1);
    }

    #[test]
    fn test_small_read_buffer_reassembles_records() {
        let source = shared(
            ScriptedSource::new().data(
                RawEventBuilder::new()
                    .name_event(EventMask::CREATE, 1, b"dir-data", "one")
                    .name_event(EventMask::DELETE, 1, b"dir-data", "two")
                    .build(),
            ),
        );
        let (tx, rx) = bounded(16);

        let mut dispatch = DispatchLoop::new(
            source,
            DispatchConfig {
                read_buffer_size: 7,
                ..config()
            },
        );
        let _ = dispatch.run(&tx);

        let received: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(paths(&received), vec!["/data/one", "/data/two"]);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let source = shared(ScriptedSource::new().step(Step::Fail(io::ErrorKind::Other)));
        let (tx, _rx) = bounded(1);

        let err = DispatchLoop::new(Arc::clone(&source), config())
            .run(&tx)
            .unwrap_err();

        assert!(matches!(err, DispatchError::Source(_)));
        assert!(source.lock().is_closed());
    }

    #[test]
    fn test_disconnected_receiver_is_fatal() {
        let source = shared(
            ScriptedSource::new().data(RawEventBuilder::new().fd_event(EventMask::MODIFY, 20, 1).build()),
        );
        let (tx, rx) = bounded(1);
        drop(rx);

        let err = DispatchLoop::new(source, config()).run(&tx).unwrap_err();
        assert!(matches!(err, DispatchError::Disconnected));
    }

    #[test]
    fn test_stop_handle_ends_loop() {
        let source = shared(ScriptedSource::new().ending(ScriptEnd::Idle));
        let (tx, _rx) = bounded(1);

        let mut dispatch = DispatchLoop::new(Arc::clone(&source), config());
        let handle = dispatch.stop_handle();
        let worker = std::thread::spawn(move || dispatch.run(&tx));

        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
        let stats = worker.join().unwrap().unwrap();

        assert_eq!(stats.events, 0);
        assert_eq!(handle.state(), LoopState::Idle);
        assert!(source.lock().is_closed());
    }

    #[test]
    fn test_registry_change_visible_to_running_loop() {
        let source = shared(ScriptedSource::new().ending(ScriptEnd::Idle));
        let registry = Arc::new(WatchRegistry::with_shared(Arc::clone(&source)));
        let (tx, rx) = bounded(4);

        let mut dispatch = DispatchLoop::new(Arc::clone(&source), config())
            .with_reconciler(Arc::clone(&registry), Duration::from_secs(3600));
        let handle = dispatch.stop_handle();
        let worker = std::thread::spawn(move || dispatch.run(&tx));

        registry.add_watch("/data", EventMask::CREATE, false).unwrap();
        assert_eq!(
            source.lock().mark_of(Path::new("/data")),
            Some(EventMask::CREATE)
        );
        source.lock().push(Step::Data(
            RawEventBuilder::new()
                .name_event(EventMask::CREATE, 1, b"dir-data", "late")
                .build(),
        ));

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.stop();
        worker.join().unwrap().unwrap();

        assert_eq!(paths(&[received]), vec!["/data/late"]);
    }
}
