//! # Startup Coordinator
//!
//! Races "wait for fresh server data" against "carry on with what is on
//! disk". Configuration and media sync each own one.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Startup Check States                             │
//! │                                                                         │
//! │  NotStarted ──begin()──┬── connected ──────────────► Fetching           │
//! │                        │                                 │              │
//! │                        └── offline ──► WaitingFor ───────┘              │
//! │                                        Connection  (one-shot watcher)   │
//! │                                                                         │
//! │  Fetching / WaitingForConnection ──finish()──► Complete                 │
//! │  NotStarted ──complete_locally()──► Complete  (remote sync disabled)    │
//! │                                                                         │
//! │  finish() is reached by whichever arrives first:                        │
//! │    • the fetch outcome (success or failure)                             │
//! │    • the startup timeout                                                │
//! │  The first one cancels the timer, drops the watcher and emits           │
//! │  StartupCompleted exactly once. Later triggers are no-ops.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The timeout runs even when the connection is already up at `begin()`,
//! so a server that accepts the request and never answers cannot hold
//! startup open.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::dispatcher::ResponseRoute;
use crate::error::SyncError;
use crate::protocol::Method;
use crate::status::SyncEvent;
use crate::timer::{TimerId, TimerKind};

/// The two synced domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    Configuration,
    Media,
}

impl SyncDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Configuration => "configuration",
            SyncDomain::Media => "media",
        }
    }

    /// RPC that fetches this domain's state.
    pub fn fetch_method(&self) -> Method {
        match self {
            SyncDomain::Configuration => Method::GetConfig,
            SyncDomain::Media => Method::GetMedia,
        }
    }
}

impl std::fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupState {
    #[default]
    NotStarted,
    WaitingForConnection,
    Fetching,
    /// Terminal.
    Complete,
}

/// Bootstrap state machine for one domain.
#[derive(Debug)]
pub struct StartupCoordinator {
    domain: SyncDomain,
    timeout: Duration,
    state: StartupState,
    timer: Option<TimerId>,
    watching: bool,
}

impl StartupCoordinator {
    pub fn new(domain: SyncDomain, timeout: Duration) -> Self {
        StartupCoordinator {
            domain,
            timeout,
            state: StartupState::NotStarted,
            timer: None,
            watching: false,
        }
    }

    pub fn domain(&self) -> SyncDomain {
        self.domain
    }

    pub fn state(&self) -> StartupState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state,
            StartupState::WaitingForConnection | StartupState::Fetching
        )
    }

    pub fn is_complete(&self) -> bool {
        self.state == StartupState::Complete
    }

    /// Starts the check. Only the first call does anything.
    pub fn begin(&mut self, ctx: &mut SyncContext, params: Value) {
        if self.state != StartupState::NotStarted {
            return;
        }

        info!(domain = %self.domain, timeout = ?self.timeout, "Startup check started");
        self.timer = Some(ctx.schedule(TimerKind::StartupTimeout(self.domain), self.timeout));

        if ctx.is_connected() {
            self.fetch(ctx, params);
        } else {
            debug!(domain = %self.domain, "Waiting for connection");
            self.state = StartupState::WaitingForConnection;
            self.watching = true;
        }
    }

    /// Completes a check that never contacts the server. Only valid before
    /// `begin()`; returns true if it emitted `StartupCompleted`.
    pub fn complete_locally(&mut self, ctx: &mut SyncContext) -> bool {
        if self.state != StartupState::NotStarted {
            return false;
        }
        self.state = StartupState::Complete;

        info!(domain = %self.domain, "Remote sync disabled, startup check complete");
        ctx.emit(SyncEvent::StartupCompleted(self.domain));
        true
    }

    /// Fires the one-shot connection watcher. Returns true if it was armed.
    pub fn on_connected(&mut self, ctx: &mut SyncContext, params: Value) -> bool {
        if !self.watching || self.state != StartupState::WaitingForConnection {
            return false;
        }
        self.watching = false;
        self.fetch(ctx, params);
        true
    }

    /// Completes the check. Returns true only for the call that did it.
    pub fn finish(&mut self, ctx: &mut SyncContext) -> bool {
        if !self.is_in_progress() {
            return false;
        }

        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        self.watching = false;
        self.state = StartupState::Complete;

        info!(domain = %self.domain, "Startup check complete");
        ctx.emit(SyncEvent::StartupCompleted(self.domain));
        true
    }

    /// Handles a startup timer. Returns true if this expiry completed the
    /// check.
    pub fn on_timeout(&mut self, ctx: &mut SyncContext, id: TimerId) -> bool {
        if self.timer != Some(id) {
            return false;
        }
        self.timer = None;

        let timeout = SyncError::StartupTimeout {
            domain: self.domain.to_string(),
            after_ms: self.timeout.as_millis() as u64,
        };
        warn!("{timeout}, continuing with local state");
        self.finish(ctx)
    }

    fn fetch(&mut self, ctx: &mut SyncContext, params: Value) {
        self.state = StartupState::Fetching;
        ctx.call(
            self.domain.fetch_method(),
            params,
            ResponseRoute::Fetch(self.domain),
        );
    }
}
