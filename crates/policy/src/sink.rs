//! Action sink
//!
//! An ordered, bounded channel between the decision engine and whatever
//! consumes actions. When the channel is full the producer either blocks or
//! evicts the oldest queued action, depending on `OverflowPolicy`.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use fanwatch_core::Action;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// What the producer does when the sink is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for room
    #[default]
    Block,
    /// Evict the oldest queued action
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            other => Err(format!("unknown sink overflow policy: {}", other)),
        }
    }
}

/// The receiving side is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("action sink closed")]
pub struct SinkClosed;

/// Create a sink holding at most `capacity` queued actions
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (ActionSender, ActionReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));

    let sender = ActionSender {
        tx,
        evict: match policy {
            OverflowPolicy::Block => None,
            OverflowPolicy::DropOldest => Some(rx.clone()),
        },
        policy,
        closed: Arc::clone(&closed),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let receiver = ActionReceiver { rx, closed };
    (sender, receiver)
}

/// Producer side of the sink
#[derive(Debug, Clone)]
pub struct ActionSender {
    tx: Sender<Action>,
    /// Second handle on the queue used to evict from the front
    evict: Option<Receiver<Action>>,
    policy: OverflowPolicy,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl ActionSender {
    /// Append an action
    pub fn send(&self, action: Action) -> Result<(), SinkClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkClosed);
        }

        let evict = match (&self.policy, &self.evict) {
            (OverflowPolicy::DropOldest, Some(evict)) => evict,
            _ => return self.tx.send(action).map_err(|_| SinkClosed),
        };

        let mut action = action;
        loop {
            match self.tx.try_send(action) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(SinkClosed),
                Err(TrySendError::Full(back)) => {
                    action = back;
                    if let Ok(oldest) = evict.try_recv() {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            kind = %oldest.kind,
                            path = %oldest.record.path().display(),
                            dropped,
                            "Action sink full, dropped oldest action"
                        );
                    }
                }
            }
        }
    }

    /// Actions evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

/// Consumer side of the sink
#[derive(Debug)]
pub struct ActionReceiver {
    rx: Receiver<Action>,
    closed: Arc<AtomicBool>,
}

impl ActionReceiver {
    /// Next action; `None` once every sender is gone and the queue is empty
    pub fn recv(&self) -> Option<Action> {
        self.rx.recv().ok()
    }

    /// Next action, waiting at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Action, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Actions queued right now
    pub fn try_iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.rx.try_iter()
    }

    /// Blocking iterator that ends when every sender is gone
    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.rx.iter()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for ActionReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Consumer of actions at the process boundary
pub trait ActionHandler: Send {
    fn handle(&mut self, action: &Action) -> anyhow::Result<()>;

    /// Called once after the last action
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Counters from `drain`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub handled: u64,
    pub failures: u64,
}

/// Feed every action to each handler until the sink is closed and empty.
///
/// A failing handler is logged and does not stop the others.
pub fn drain(receiver: &ActionReceiver, handlers: &mut [Box<dyn ActionHandler>]) -> DrainStats {
    let mut stats = DrainStats::default();

    for action in receiver.iter() {
        stats.handled += 1;
        for handler in handlers.iter_mut() {
            if let Err(err) = handler.handle(&action) {
                stats.failures += 1;
                warn!(error = %err, "Action handler failed");
            }
        }
    }

    for handler in handlers.iter_mut() {
        if let Err(err) = handler.flush() {
            warn!(error = %err, "Action handler flush failed");
        }
    }
    stats
}
