//! # Cancellable Timers
//!
//! One-shot timers that report back to the event loop.
//!
//! Each timer is a spawned sleep that sends `LoopEvent::Timer(id)` when it
//! expires. The loop asks [`Timers::fire`] what the id means; a timer that
//! was cancelled in the meantime is no longer registered, so a late event
//! for it resolves to `None` and is dropped. That is what keeps the
//! reconnect delay and the startup timeouts from firing twice.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::LoopEvent;
use crate::startup::SyncDomain;

/// Identifies one scheduled timer. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fixed delay before the next connect attempt.
    Reconnect,
    /// Startup bootstrap gave up waiting for the server.
    StartupTimeout(SyncDomain),
    /// Periodic configuration re-fetch.
    ConfigurationRefresh,
}

struct ScheduledTimer {
    kind: TimerKind,
    handle: JoinHandle<()>,
}

/// Registry of live timers, owned by the event loop.
pub struct Timers {
    next_id: u64,
    active: HashMap<TimerId, ScheduledTimer>,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl Timers {
    pub fn new(events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Timers {
            next_id: 0,
            active: HashMap::new(),
            events,
        }
    }

    /// Starts a timer that fires once after `after`.
    pub fn schedule(&mut self, kind: TimerKind, after: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(LoopEvent::Timer(id));
        });

        debug!(?id, ?kind, ?after, "Timer scheduled");
        self.active.insert(id, ScheduledTimer { kind, handle });
        id
    }

    /// Cancels a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.active.remove(&id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Resolves an expiry event. `None` means the timer was cancelled after
    /// its event was queued.
    pub fn fire(&mut self, id: TimerId) -> Option<TimerKind> {
        self.active.remove(&id).map(|timer| timer.kind)
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancels everything. Used on shutdown.
    pub fn cancel_all(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
