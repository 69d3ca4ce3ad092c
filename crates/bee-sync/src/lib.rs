//! # bee-sync: Sync Engine for the Bee Device Client
//!
//! Keeps the device configuration and media assets in step with the
//! backend over one long-lived WebSocket, and keeps the device running on
//! its last known-good state whenever the backend is out of reach.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncEngine (single event loop)                  │  │
//! │  │                                                                  │  │
//! │  │  Spawned as one Tokio task by bee-agent                          │  │
//! │  │  Owns every piece of sync state; handlers never block           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Connection     │  │ Request        │  │ TopicRouter            │    │
//! │  │ Manager        │  │ Dispatcher     │  │                        │    │
//! │  │                │  │                │  │ Desired topics,        │    │
//! │  │ WebSocket,     │  │ JSON-RPC ids,  │  │ resubscribe on every   │    │
//! │  │ fixed 5 s      │  │ fail in-flight │  │ connect, publish       │    │
//! │  │ reconnect      │  │ on disconnect  │  │ fan-out                │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────────────────────┐  ┌────────────────────────────┐    │
//! │  │ ConfigurationSync              │  │ MediaSync                  │    │
//! │  │                                │  │                            │    │
//! │  │ StartupCoordinator (10 s)      │  │ StartupCoordinator (5 s)   │    │
//! │  │ Versioned replace + persist    │  │ Diff, delete, download     │    │
//! │  │ Periodic re-fetch (5 min)      │  │ Partial failure tolerated  │    │
//! │  └────────────────────────────────┘  └────────────────────────────┘    │
//! │                                                                         │
//! │  OBSERVATIONS:                                                          │
//! │  • SyncEvent via SyncEventEmitter (Connected, ConfigurationChanged, …)   │
//! │  • SyncStatus via tokio::sync::watch                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - The event loop, its builder and handle
//! - [`context`] - Shared loop machinery handed to each component
//! - [`timer`] - Cancellable one-shot timers
//!
//! ### Wire
//! - [`connection`] - WebSocket lifecycle and reconnect policy
//! - [`dispatcher`] - Request/response correlation
//! - [`router`] - Topic subscriptions and publish fan-out
//! - [`protocol`] - Envelope encoding and decoding
//!
//! ### Domains
//! - [`startup`] - Startup check shared by both domains
//! - [`configuration`] - Device configuration sync
//! - [`media`] - Media asset reconciliation
//!
//! ### Collaborators
//! - [`storage`] - Configuration file and media directory stores
//! - [`bulk`] - Asset download transport
//! - [`link`] - Network link monitor
//! - [`status`] - Status snapshot, events and emitters
//! - [`config`] - Engine configuration (TOML + environment)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bee_sync::{BroadcastEmitter, LinkMonitor, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let config = SyncConfig::load_or_default(None);
//! let (link, _poller) = LinkMonitor::from_config(&config).spawn().await;
//! let (emitter, mut events) = BroadcastEmitter::new(64);
//!
//! let (engine, handle) = SyncEngine::builder(config)
//!     .with_link(link)
//!     .with_emitter(Arc::new(emitter))
//!     .build()?;
//! let task = engine.spawn();
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod context;
pub mod engine;
pub mod timer;

// Wire
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod router;

// Domains
pub mod configuration;
pub mod media;
pub mod startup;

// Collaborators
pub mod bulk;
pub mod config;
pub mod error;
pub mod link;
pub mod status;
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

pub use bulk::{BulkTransport, HttpBulkTransport};
pub use config::SyncConfig;
pub use connection::{ConnectionState, Connector, SessionLink, WsConnector};
pub use engine::{SyncEngine, SyncEngineBuilder, SyncEngineHandle};
pub use error::{SyncError, SyncResult};
pub use link::LinkMonitor;
pub use protocol::{Method, Topic};
pub use startup::SyncDomain;
pub use status::{BroadcastEmitter, NoOpEmitter, SyncEvent, SyncEventEmitter, SyncStatus};
pub use storage::{
    ConfigStore, DirMediaStore, JsonFileStore, MediaStore, MemoryConfigStore, MemoryMediaStore,
    MemorySettingsStore, SettingsStore, TomlSettingsStore,
};
