//! Single-shot protocol timers.
//!
//! Expirations are never handled where they fire: each timer task posts a
//! [`Work::Timer`] back into the dispatcher channel. Every arm gets a fresh
//! generation number so an expiry that was already queued when the timer
//! was cancelled or re-armed is recognised as stale and dropped.

use crate::dispatch::Work;
use crate::types::RouterId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// The two timers every router owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// MASTER: time to send the next advertisement
    Advertisement,
    /// BACKUP: the master has been silent for too long
    MasterDown,
}

/// Timer scheduling seam used by the state machine.
#[cfg_attr(test, mockall::automock)]
pub trait Timers: Send {
    /// (Re)arm a timer; any pending expiry of the same kind is discarded.
    fn arm(&mut self, router: RouterId, kind: TimerKind, after: Duration);

    /// Cancel a timer. Must take effect before returning.
    fn cancel(&mut self, router: RouterId, kind: TimerKind);
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

/// Tokio-backed timers that fire into the dispatcher channel.
pub struct TaskTimers {
    tx: mpsc::WeakUnboundedSender<Work>,
    pending: HashMap<(RouterId, TimerKind), Pending>,
    generation: u64,
}

impl TaskTimers {
    pub(crate) fn new(tx: mpsc::WeakUnboundedSender<Work>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
            generation: 0,
        }
    }

    /// Claim a delivered expiry. False if it is stale.
    pub(crate) fn claim(&mut self, router: RouterId, kind: TimerKind, generation: u64) -> bool {
        match self.pending.get(&(router, kind)) {
            Some(p) if p.generation == generation => {
                self.pending.remove(&(router, kind));
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, router: RouterId, kind: TimerKind) -> bool {
        self.pending.contains_key(&(router, kind))
    }
}

impl Timers for TaskTimers {
    fn arm(&mut self, router: RouterId, kind: TimerKind, after: Duration) {
        self.cancel(router, kind);

        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Work::Timer {
                    router,
                    kind,
                    generation,
                });
            }
        });

        trace!(%router, ?kind, ?after, generation, "timer armed");
        self.pending.insert((router, kind), Pending { generation, task });
    }

    fn cancel(&mut self, router: RouterId, kind: TimerKind) {
        if let Some(pending) = self.pending.remove(&(router, kind)) {
            pending.task.abort();
        }
    }
}

impl Drop for TaskTimers {
    fn drop(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
    }
}

/// Timers that only remember what is armed. Used by the synchronous tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualTimers {
    pub armed: HashMap<(RouterId, TimerKind), Duration>,
}

#[cfg(test)]
impl ManualTimers {
    pub fn get(&self, router: RouterId, kind: TimerKind) -> Option<Duration> {
        self.armed.get(&(router, kind)).copied()
    }
}

#[cfg(test)]
impl Timers for ManualTimers {
    fn arm(&mut self, router: RouterId, kind: TimerKind, after: Duration) {
        self.armed.insert((router, kind), after);
    }

    fn cancel(&mut self, router: RouterId, kind: TimerKind) {
        self.armed.remove(&(router, kind));
    }
}
