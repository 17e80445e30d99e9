use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Signaling,
    Grace,
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerFired {
    pub kind: TimerKind,
    pub id: u64,
}

struct Armed {
    id: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

/// Session timers, delivered as events on the driver's channel.
///
/// Each arm gets a fresh id. Cancelling aborts the sleeping task, and an
/// expiry that was already queued is rejected by [`Timers::accept`].
pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    next_id: u64,
    armed: HashMap<TimerKind, Armed>,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            next_id: 0,
            armed: HashMap::new(),
        }
    }

    /// Fire once after `after`, replacing any timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        let id = self.next_id();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerFired { kind, id });
        });
        self.replace(kind, Armed { id, repeating: false, handle });
        tracing::debug!("{kind:?} timer armed for {after:?}");
    }

    /// Fire every `period`, first tick one period from now.
    pub fn every(&mut self, kind: TimerKind, period: Duration) {
        let id = self.next_id();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(TimerFired { kind, id }).is_err() {
                    break;
                }
            }
        });
        self.replace(kind, Armed { id, repeating: true, handle });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(armed) = self.armed.remove(&kind) {
            armed.handle.abort();
            tracing::debug!("{kind:?} timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Whether `fired` belongs to the live timer of its kind. A one-shot
    /// timer is disarmed once accepted.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some(armed) if armed.id == fired.id => {
                if !armed.repeating {
                    self.armed.remove(&fired.kind);
                }
                true
            }
            _ => false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn replace(&mut self, kind: TimerKind, armed: Armed) {
        if let Some(old) = self.armed.insert(kind, armed) {
            old.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
