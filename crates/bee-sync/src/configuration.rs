//! # Configuration Sync
//!
//! Holds the authoritative [`DeviceConfiguration`] and keeps it in step
//! with the server.
//!
//! ## Payload Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │            getConfig response / `configuration` publish                 │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                 has an `applications` array? ── no ──► log, keep state  │
//! │                              │ yes                                      │
//! │                              ▼                                          │
//! │                  version == held version? ── yes ──► last_sync_time     │
//! │                              │ no                                       │
//! │                              ▼                                          │
//! │          replace, persist (best effort), update held version            │
//! │                              │                                          │
//! │                              ▼                                          │
//! │        startup complete? ── yes ──► ConfigurationChanged                │
//! │                                                                         │
//! │  Startup completion always emits ConfigurationChanged once, so          │
//! │  consumers get a single signal to load from whether or not the first    │
//! │  payload changed anything.                                              │
//! │                                                                         │
//! │  save(system, apps) ──► build, persist, ConfigurationChanged (always)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use bee_core::device_config::ApplicationDocument;
use bee_core::DeviceConfiguration;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::dispatcher::ResponseRoute;
use crate::error::{SyncError, SyncResult};
use crate::startup::{StartupCoordinator, StartupState, SyncDomain};
use crate::status::{ConfigurationStatus, SyncEvent};
use crate::storage::ConfigStore;
use crate::timer::{TimerId, TimerKind};

pub struct ConfigurationSync {
    store: Arc<dyn ConfigStore>,
    device_id: String,
    startup: StartupCoordinator,
    interval: Duration,
    /// Off when the server is disabled; the local store is then final.
    remote: bool,
    refresh_timer: Option<TimerId>,
    current: Option<DeviceConfiguration>,
    /// Version last accepted from the server or disk. `save()` leaves it
    /// alone.
    version: String,
    syncing: bool,
    last_sync_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ConfigurationSync {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        device_id: impl Into<String>,
        startup_timeout: Duration,
        interval: Duration,
    ) -> Self {
        ConfigurationSync {
            store,
            device_id: device_id.into(),
            startup: StartupCoordinator::new(SyncDomain::Configuration, startup_timeout),
            interval,
            remote: true,
            refresh_timer: None,
            current: None,
            version: String::new(),
            syncing: false,
            last_sync_time: None,
            last_error: None,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn ConfigStore>) -> Self {
        Self::new(
            store,
            config.device_id(),
            config.configuration_timeout(),
            config.configuration_interval(),
        )
        .with_remote(config.server.enabled)
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Loads the local baseline and begins the startup check.
    pub fn start(&mut self, ctx: &mut SyncContext) {
        if self.startup.state() != StartupState::NotStarted {
            return;
        }
        self.load_local();

        if !self.remote {
            if self.startup.complete_locally(ctx) {
                ctx.emit(SyncEvent::ConfigurationChanged);
            }
            return;
        }
        let params = self.fetch_params();
        self.startup.begin(ctx, params);
        self.syncing = self.startup.state() == StartupState::Fetching;
    }

    pub fn on_connected(&mut self, ctx: &mut SyncContext) {
        let params = self.fetch_params();
        if self.startup.on_connected(ctx, params) {
            self.syncing = true;
        }
    }

    /// Outcome of a `getConfig`, startup or periodic.
    pub fn on_fetch_result(&mut self, ctx: &mut SyncContext, outcome: SyncResult<Value>) {
        self.syncing = false;
        match outcome {
            Ok(payload) => {
                self.apply_payload(ctx, &payload);
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch configuration");
                self.last_error = Some(e.to_string());
            }
        }

        if self.startup.finish(ctx) {
            self.after_startup(ctx);
        }
    }

    /// A `configuration` publish. Never completes startup on its own.
    pub fn on_push(&mut self, ctx: &mut SyncContext, payload: &Value) {
        debug!("Configuration pushed by server");
        self.apply_payload(ctx, payload);
    }

    pub fn on_startup_timeout(&mut self, ctx: &mut SyncContext, id: TimerId) {
        if self.startup.on_timeout(ctx, id) {
            info!(version = %self.version, "Using local configuration");
            self.after_startup(ctx);
        }
    }

    pub fn on_refresh_timer(&mut self, ctx: &mut SyncContext, id: TimerId) {
        if self.refresh_timer != Some(id) {
            return;
        }
        self.refresh_timer = None;
        self.schedule_refresh(ctx);

        if self.syncing || !ctx.is_connected() {
            debug!(syncing = self.syncing, "Skipping periodic configuration fetch");
            return;
        }
        self.syncing = true;
        ctx.call(
            SyncDomain::Configuration.fetch_method(),
            self.fetch_params(),
            ResponseRoute::Fetch(SyncDomain::Configuration),
        );
    }

    // =========================================================================
    // Caller Operations
    // =========================================================================

    /// Replaces the configuration with locally edited content.
    ///
    /// Keeps the previous version, device id and active app; with no valid
    /// previous configuration the configured device id is used. The change
    /// is always announced, even if persisting fails.
    pub fn save(
        &mut self,
        ctx: &mut SyncContext,
        system_configuration: Map<String, Value>,
        applications: Vec<ApplicationDocument>,
    ) -> SyncResult<()> {
        let mut config = DeviceConfiguration::new();
        match &self.current {
            Some(previous) if previous.is_valid() => {
                config.version = previous.version.clone();
                config.device_id = previous.device_id.clone();
                config.active_app_id = previous.active_app_id.clone();
            }
            _ => config.device_id = self.device_id.clone(),
        }

        config.system_configuration = system_configuration;
        for app in applications {
            config.add_application(app);
        }
        config.sort_applications_by_order();

        info!(
            applications = config.application_count(),
            "Saving configuration"
        );
        let persisted = self.store.save(&config);
        self.current = Some(config);
        ctx.emit(SyncEvent::ConfigurationChanged);

        if let Err(e) = &persisted {
            error!(error = %e, "Failed to persist configuration");
        }
        persisted
    }

    pub fn trigger_configuration_changed(&mut self, ctx: &mut SyncContext) {
        info!("Configuration change triggered manually");
        ctx.emit(SyncEvent::ConfigurationChanged);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn current(&self) -> Option<&DeviceConfiguration> {
        self.current.as_ref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn startup_check_in_progress(&self) -> bool {
        self.startup.is_in_progress()
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    pub fn status(&self) -> ConfigurationStatus {
        ConfigurationStatus {
            syncing: self.syncing,
            version: self.version.clone(),
            last_sync_time: self.last_sync_time,
            startup_check_in_progress: self.startup.is_in_progress(),
            last_error: self.last_error.clone(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fetch_params(&self) -> Value {
        json!({ "device_id": self.device_id })
    }

    fn load_local(&mut self) {
        match self.store.load() {
            Ok(Some(config)) if config.is_valid() && config.has_applications() => {
                info!(version = %config.version, "Loaded local configuration");
                self.version = config.version.clone();
                self.current = Some(config);
            }
            Ok(_) => info!("No valid local configuration found"),
            Err(e) => warn!(error = %e, "Failed to load local configuration"),
        }
    }

    /// Returns true if the payload replaced the configuration.
    fn apply_payload(&mut self, ctx: &mut SyncContext, payload: &Value) -> bool {
        let config = match DeviceConfiguration::from_payload(payload) {
            Ok(config) => config,
            Err(e) => {
                let e = SyncError::from(e);
                warn!(error = %e, "Rejected configuration payload, keeping current");
                self.last_error = Some(e.to_string());
                return false;
            }
        };

        let changed = config.version != self.version;
        if changed {
            info!(from = %self.version, to = %config.version, "Configuration version changed");
            if let Err(e) = self.store.save(&config) {
                error!(error = %e, "Failed to persist configuration");
            }
            self.version = config.version.clone();
            self.current = Some(config);

            if self.startup.is_complete() {
                ctx.emit(SyncEvent::ConfigurationChanged);
            }
        }

        self.last_sync_time = Some(Utc::now());
        self.last_error = None;
        changed
    }

    fn after_startup(&mut self, ctx: &mut SyncContext) {
        ctx.emit(SyncEvent::ConfigurationChanged);
        self.schedule_refresh(ctx);
        info!(interval = ?self.interval, "Configuration startup complete, periodic sync armed");
    }

    fn schedule_refresh(&mut self, ctx: &mut SyncContext) {
        if let Some(id) = self.refresh_timer.take() {
            ctx.cancel(id);
        }
        self.refresh_timer = Some(ctx.schedule(TimerKind::ConfigurationRefresh, self.interval));
    }

    #[cfg(test)]
    pub(crate) fn refresh_timer(&self) -> Option<TimerId> {
        self.refresh_timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::storage::MemoryConfigStore;
    use tokio::sync::mpsc;

    fn payload(version: &str) -> Value {
        json!({
            "version": version,
            "device_id": "dev-1",
            "active_app_id": "clock",
            "system-configuration": {"brightness": 80},
            "applications": [
                {"id": "clock", "type": "clock", "name": "Clock", "order": 0, "watchface": "digital"}
            ]
        })
    }

    fn app(id: &str, order: i64) -> ApplicationDocument {
        match json!({"id": id, "type": "countdown", "order": order}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn sync_with(store: Arc<MemoryConfigStore>) -> ConfigurationSync {
        ConfigurationSync::new(store, "dev-1", Duration::from_secs(10), Duration::from_secs(300))
    }

    fn changed_count(ctx: &mut SyncContext) -> usize {
        ctx.drain_events()
            .into_iter()
            .filter(|e| *e == SyncEvent::ConfigurationChanged)
            .count()
    }

    fn next_request(frames: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&frames.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_start_loads_local_baseline() {
        let local = DeviceConfiguration::from_payload(&payload("4")).unwrap();
        let store = Arc::new(MemoryConfigStore::with_config(local));
        let (mut ctx, _rx) = test_context();
        let mut sync = sync_with(store);

        sync.start(&mut ctx);

        assert_eq!(sync.version(), "4");
        assert!(sync.current().is_some());
        assert!(sync.startup_check_in_progress());
        assert!(!sync.is_syncing());
    }

    #[tokio::test]
    async fn test_start_without_remote_uses_local_only() {
        let local = DeviceConfiguration::from_payload(&payload("4")).unwrap();
        let store = Arc::new(MemoryConfigStore::with_config(local));
        let (mut ctx, _rx) = test_context();
        let _frames = ctx.force_connected();
        let mut sync = sync_with(store).with_remote(false);

        sync.start(&mut ctx);

        assert_eq!(sync.version(), "4");
        assert!(!sync.startup_check_in_progress());
        assert!(!sync.is_syncing());
        assert!(sync.refresh_timer().is_none());
        assert_eq!(ctx.dispatcher.pending_count(), 0);
        assert_eq!(
            ctx.drain_events(),
            vec![
                SyncEvent::StartupCompleted(SyncDomain::Configuration),
                SyncEvent::ConfigurationChanged,
            ]
        );

        // Connecting later does not start a fetch.
        sync.on_connected(&mut ctx);
        assert_eq!(ctx.dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_startup_fetch_emits_one_change() {
        let store = Arc::new(MemoryConfigStore::new());
        let (mut ctx, _rx) = test_context();
        let mut frames = ctx.force_connected();
        let mut sync = sync_with(store.clone());

        sync.start(&mut ctx);
        assert!(sync.is_syncing());
        let request = next_request(&mut frames);
        assert_eq!(request["method"], "getConfig");
        assert_eq!(request["params"]["device_id"], "dev-1");

        sync.on_fetch_result(&mut ctx, Ok(payload("1")));

        assert!(!sync.startup_check_in_progress());
        assert_eq!(sync.version(), "1");
        assert_eq!(store.saved().unwrap().version, "1");
        assert!(sync.last_sync_time().is_some());
        assert!(sync.refresh_timer().is_some());

        let events = ctx.drain_events();
        assert_eq!(
            events,
            vec![
                SyncEvent::StartupCompleted(SyncDomain::Configuration),
                SyncEvent::ConfigurationChanged,
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_still_completes_startup() {
        let (mut ctx, _rx) = test_context();
        let _frames = ctx.force_connected();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));

        sync.start(&mut ctx);
        sync.on_fetch_result(&mut ctx, Err(SyncError::RequestFailed("boom".into())));

        assert!(!sync.startup_check_in_progress());
        assert_eq!(sync.status().last_error.as_deref(), Some("Request failed: boom"));
        assert_eq!(changed_count(&mut ctx), 1);
    }

    #[tokio::test]
    async fn test_push_after_startup_emits_change_once() {
        let (mut ctx, _rx) = test_context();
        let _frames = ctx.force_connected();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));
        sync.start(&mut ctx);
        sync.on_fetch_result(&mut ctx, Ok(payload("1")));
        ctx.drain_events();

        sync.on_push(&mut ctx, &payload("2"));
        assert_eq!(changed_count(&mut ctx), 1);
        assert_eq!(sync.current().unwrap().version, "2");

        // Same version again: timestamp only.
        let before = sync.last_sync_time();
        sync.on_push(&mut ctx, &payload("2"));
        assert_eq!(changed_count(&mut ctx), 0);
        assert!(sync.last_sync_time() >= before);
    }

    #[tokio::test]
    async fn test_push_during_startup_is_silent() {
        let (mut ctx, _rx) = test_context();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));
        sync.start(&mut ctx);

        sync.on_push(&mut ctx, &payload("9"));
        assert_eq!(sync.version(), "9");
        assert!(sync.startup_check_in_progress());
        assert_eq!(changed_count(&mut ctx), 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_keeps_current() {
        let (mut ctx, _rx) = test_context();
        let _frames = ctx.force_connected();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));
        sync.start(&mut ctx);
        sync.on_fetch_result(&mut ctx, Ok(payload("1")));
        ctx.drain_events();

        sync.on_push(&mut ctx, &json!({"version": "2", "device_id": "dev-1"}));
        sync.on_push(&mut ctx, &json!(["not", "an", "object"]));

        assert_eq!(sync.version(), "1");
        assert_eq!(sync.current().unwrap().version, "1");
        assert!(sync.status().last_error.is_some());
        assert_eq!(changed_count(&mut ctx), 0);
    }

    #[tokio::test]
    async fn test_save_preserves_metadata_and_sorts() {
        let store = Arc::new(MemoryConfigStore::new());
        let (mut ctx, _rx) = test_context();
        let _frames = ctx.force_connected();
        let mut sync = sync_with(store.clone());
        sync.start(&mut ctx);
        sync.on_fetch_result(&mut ctx, Ok(payload("5")));
        ctx.drain_events();

        let mut system = Map::new();
        system.insert("volume".into(), json!(3));
        sync.save(&mut ctx, system, vec![app("b", 2), app("a", 1)])
            .unwrap();

        let saved = store.saved().unwrap();
        assert_eq!(saved.version, "5");
        assert_eq!(saved.device_id, "dev-1");
        assert_eq!(saved.active_app_id, "clock");
        assert_eq!(saved.system_configuration["volume"], 3);
        let ids: Vec<_> = saved.applications.iter().map(|a| a["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b")]);

        assert_eq!(sync.version(), "5");
        assert_eq!(changed_count(&mut ctx), 1);
    }

    #[tokio::test]
    async fn test_save_without_prior_config_uses_device_id() {
        let store = Arc::new(MemoryConfigStore::new());
        let (mut ctx, _rx) = test_context();
        let mut sync = sync_with(store.clone());

        sync.save(&mut ctx, Map::new(), vec![app("a", 0)]).unwrap();
        let saved = store.saved().unwrap();
        assert_eq!(saved.device_id, "dev-1");
        assert_eq!(saved.version, bee_core::DEFAULT_CONFIGURATION_VERSION);
    }

    #[tokio::test]
    async fn test_refresh_timer_fetches_when_idle() {
        let (mut ctx, _rx) = test_context();
        let mut frames = ctx.force_connected();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));
        sync.start(&mut ctx);
        let _startup_request = next_request(&mut frames);
        sync.on_fetch_result(&mut ctx, Ok(payload("1")));

        let timer = sync.refresh_timer().unwrap();
        assert!(ctx.timers.fire(timer).is_some());
        sync.on_refresh_timer(&mut ctx, timer);

        assert!(sync.is_syncing());
        assert_eq!(next_request(&mut frames)["method"], "getConfig");
        assert!(sync.refresh_timer().is_some());

        // A second tick while the first fetch is outstanding sends nothing.
        let timer = sync.refresh_timer().unwrap();
        sync.on_refresh_timer(&mut ctx, timer);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trigger_configuration_changed() {
        let (mut ctx, _rx) = test_context();
        let mut sync = sync_with(Arc::new(MemoryConfigStore::new()));
        sync.trigger_configuration_changed(&mut ctx);
        assert_eq!(changed_count(&mut ctx), 1);
    }
}
