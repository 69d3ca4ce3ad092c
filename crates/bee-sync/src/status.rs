//! # Sync Status & Events
//!
//! What the engine exposes to the rest of the device.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Outbound Observations                           │
//! │                                                                         │
//! │  SyncStatus (watch)        level: always the latest snapshot            │
//! │    connection, server_url                                               │
//! │    configuration { syncing, version, last_sync_time, startup, error }   │
//! │    media         { syncing, last_error, startup, asset_count }          │
//! │                                                                         │
//! │  SyncEvent (emitter)       edge: fired once per occurrence              │
//! │    Connected / Disconnected                                             │
//! │    ConfigurationChanged                                                 │
//! │    StartupCompleted(domain)                                             │
//! │    MediaSyncCompleted / MediaSyncFailed(reason)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::connection::ConnectionState;
use crate::startup::SyncDomain;

// =============================================================================
// Sync Status
// =============================================================================

/// Configuration half of the status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigurationStatus {
    /// A fetch is in flight.
    pub syncing: bool,

    /// Version of the authoritative configuration.
    pub version: String,

    /// Last time a payload was accepted, changed or not.
    pub last_sync_time: Option<DateTime<Utc>>,

    pub startup_check_in_progress: bool,

    pub last_error: Option<String>,
}

/// Media half of the status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaStatus {
    /// A list fetch or download batch is in progress.
    pub syncing: bool,

    pub last_error: Option<String>,

    pub startup_check_in_progress: bool,

    /// Number of assets in the model.
    pub asset_count: usize,
}

/// Snapshot published after every loop event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Current connection state.
    pub connection: ConnectionState,

    /// URL the connection manager targets.
    pub server_url: String,

    pub configuration: ConfigurationStatus,

    pub media: MediaStatus,
}

impl SyncStatus {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// True while either domain is fetching or downloading.
    pub fn is_syncing(&self) -> bool {
        self.configuration.syncing || self.media.syncing
    }

    /// True once both startup checks have finished.
    pub fn is_ready(&self) -> bool {
        !self.configuration.startup_check_in_progress && !self.media.startup_check_in_progress
    }
}

// =============================================================================
// Sync Events
// =============================================================================

/// Edge-triggered notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Consumers should reload the configuration.
    ConfigurationChanged,
    /// A startup check finished, by fetch or by timeout.
    StartupCompleted(SyncDomain),
    MediaSyncCompleted,
    /// Reconciliation finished with errors. The model still holds every
    /// asset that did arrive.
    MediaSyncFailed(String),
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events. Called on the event loop, so implementations
/// must not block.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits one event.
    fn emit_event(&self, event: &SyncEvent);

    /// Emits a status snapshot when it changed.
    fn emit_status(&self, _status: &SyncStatus) {}
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_event(&self, _event: &SyncEvent) {}
}

/// Fans events out on a broadcast channel.
///
/// Slow receivers lag and lose the oldest events; the status watch channel
/// is the place to recover current state.
#[derive(Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<SyncEvent>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (BroadcastEmitter { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl SyncEventEmitter for BroadcastEmitter {
    fn emit_event(&self, event: &SyncEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.connection, ConnectionState::Idle);
        assert!(!status.is_connected());
        assert!(!status.is_syncing());
        assert!(status.is_ready());
        assert_eq!(status.media.asset_count, 0);
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(SyncEvent::StartupCompleted(SyncDomain::Media)).unwrap();
        assert_eq!(value["event"], "startup_completed");
        assert_eq!(value["detail"], "media");

        let value = serde_json::to_value(SyncEvent::ConfigurationChanged).unwrap();
        assert_eq!(value["event"], "configuration_changed");
    }

    #[tokio::test]
    async fn test_broadcast_emitter_fans_out() {
        let (emitter, mut first) = BroadcastEmitter::new(8);
        let mut second = emitter.subscribe();

        emitter.emit_event(&SyncEvent::Connected);

        assert_eq!(first.recv().await.unwrap(), SyncEvent::Connected);
        assert_eq!(second.recv().await.unwrap(), SyncEvent::Connected);
    }

    #[test]
    fn test_broadcast_without_receivers_is_silent() {
        let (emitter, receiver) = BroadcastEmitter::new(1);
        drop(receiver);
        emitter.emit_event(&SyncEvent::Disconnected);
    }
}
