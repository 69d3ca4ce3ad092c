//! # Sync Engine
//!
//! The event loop that owns every piece of sync state.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine (one task)                           │
//! │                                                                         │
//! │   inputs                                                                │
//! │   ──────                                                                │
//! │   LoopEvent::Socket    (session task, generation-tagged)                │
//! │   LoopEvent::Timer     (reconnect, startup timeouts, refresh)           │
//! │   LoopEvent::Download  (media download tasks, batch-tagged)             │
//! │   Command              (SyncEngineHandle)                               │
//! │   link watch           (LinkMonitor or any bool source)                 │
//! │                                                                         │
//! │         ┌────────────────────────────────────────────┐                  │
//! │         │ SyncContext                                │                  │
//! │         │   ConnectionManager  RequestDispatcher     │                  │
//! │         │   Timers             completions / events  │                  │
//! │         └───────────┬───────────────────┬────────────┘                  │
//! │                     │                   │                               │
//! │        ┌────────────┴───┐   ┌───────────┴─────┐   ┌──────────────┐      │
//! │        │ ConfigSync     │   │ MediaSync       │   │ TopicRouter  │      │
//! │        │  Startup(10 s) │   │  Startup(5 s)   │   │  desired set │      │
//! │        └────────────────┘   └─────────────────┘   └──────────────┘      │
//! │                                                                         │
//! │   outputs                                                               │
//! │   ───────                                                               │
//! │   SyncEventEmitter     (Connected, ConfigurationChanged, ...)           │
//! │   watch<SyncStatus>    (after every event, only when changed)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every handler runs to completion before the next input is taken, so
//! nothing inside needs a lock. After each input the loop settles: it
//! routes finished requests, flushes events and publishes the status.

use bee_core::device_config::ApplicationDocument;
use bee_core::{DeviceConfiguration, MediaAsset};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bulk::{BulkTransport, HttpBulkTransport};
use crate::config::{validate_url, SyncConfig};
use crate::configuration::ConfigurationSync;
use crate::connection::{
    ConnectionManager, Connector, SocketEvent, SocketEventKind, Transition, WsConnector,
};
use crate::context::SyncContext;
use crate::dispatcher::ResponseRoute;
use crate::error::{SyncError, SyncResult};
use crate::media::{DownloadResult, MediaSync};
use crate::protocol::{Inbound, Method, Topic};
use crate::router::{log_subscription_outcome, TopicRouter};
use crate::startup::SyncDomain;
use crate::status::{NoOpEmitter, SyncEvent, SyncEventEmitter, SyncStatus};
use crate::storage::{
    ConfigStore, DirMediaStore, JsonFileStore, MediaStore, SettingsStore, TomlSettingsStore,
};
use crate::timer::{TimerId, TimerKind, Timers};

const COMMAND_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Loop Inputs
// =============================================================================

/// Internal events reported by tasks the engine spawned.
pub enum LoopEvent {
    Socket(SocketEvent),
    Timer(TimerId),
    Download {
        batch: u64,
        filename: String,
        result: DownloadResult,
    },
}

/// Requests from [`SyncEngineHandle`].
enum Command {
    Call {
        method: Method,
        params: Value,
        reply: oneshot::Sender<SyncResult<Value>>,
    },
    Subscribe {
        topic: Topic,
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    Unsubscribe {
        topic: Topic,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        topic: Topic,
        params: Value,
        reply: oneshot::Sender<bool>,
    },
    Listen {
        topic: Topic,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<Value>>,
    },
    SaveConfiguration {
        system_configuration: Map<String, Value>,
        applications: Vec<ApplicationDocument>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    CurrentConfiguration {
        reply: oneshot::Sender<Option<DeviceConfiguration>>,
    },
    MediaAssets {
        reply: oneshot::Sender<Vec<MediaAsset>>,
    },
    MediaPath {
        name: String,
        reply: oneshot::Sender<String>,
    },
    TriggerConfigurationChanged,
    SetServerUrl {
        url: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    ctx: SyncContext,
    router: TopicRouter,
    configuration: ConfigurationSync,
    media: MediaSync,
    /// Settings as loaded, plus runtime edits such as the server URL.
    settings: SyncConfig,
    settings_store: Arc<dyn SettingsStore>,
    emitter: Arc<dyn SyncEventEmitter>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    commands_rx: mpsc::Receiver<Command>,
    link: Option<watch::Receiver<bool>>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Runs the loop on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until shut down or until every handle is dropped.
    pub async fn run(mut self) {
        self.start();

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }

                command = self.commands_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All engine handles dropped");
                        self.shutdown();
                        break;
                    }
                },

                changed = link_changed(&mut self.link) => match changed {
                    Some(up) => {
                        let transition = self.ctx.connection.on_link_changed(up, &mut self.ctx.timers);
                        self.apply_transition(transition);
                    }
                    None => {
                        warn!("Link status source closed, keeping last state");
                        self.link = None;
                    }
                },
            }

            self.settle();
        }

        info!("Sync engine stopped");
    }

    fn start(&mut self) {
        let link_up = self
            .link
            .as_mut()
            .map_or(true, |link| *link.borrow_and_update());
        let remote = self.settings.server.enabled;
        info!(
            url = %self.ctx.connection.url(),
            link_up,
            remote,
            "Sync engine starting"
        );

        if remote {
            self.ctx.connection.start(link_up, &mut self.ctx.timers);
        } else {
            info!("Server disabled, running from local state");
        }
        for topic in [Topic::Configuration, Topic::Media] {
            if let Err(e) = self.router.subscribe(&mut self.ctx, topic) {
                warn!(%topic, error = %e, "Failed to subscribe");
            }
        }
        self.configuration.start(&mut self.ctx);
        self.media.start(&mut self.ctx);
        self.settle();
    }

    // =========================================================================
    // Event Handling
    // =========================================================================

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Socket(event) => self.handle_socket(event),
            LoopEvent::Timer(id) => self.handle_timer(id),
            LoopEvent::Download {
                batch,
                filename,
                result,
            } => self.media.on_download(&mut self.ctx, batch, filename, result),
        }
    }

    fn handle_socket(&mut self, event: SocketEvent) {
        if !self.ctx.connection.is_current(event.generation) {
            debug!(generation = event.generation, "Dropping event from stale socket");
            return;
        }

        match event.kind {
            SocketEventKind::Opened(outbound) => {
                let transition = self.ctx.connection.on_opened(outbound);
                self.apply_transition(transition);
            }
            SocketEventKind::Message(text) => self.handle_message(&text),
            SocketEventKind::Closed(reason) => {
                let transition = self.ctx.connection.on_closed(&reason, &mut self.ctx.timers);
                self.apply_transition(transition);
            }
        }
    }

    fn handle_timer(&mut self, id: TimerId) {
        let Some(kind) = self.ctx.timers.fire(id) else {
            debug!(?id, "Ignoring cancelled timer");
            return;
        };

        match kind {
            TimerKind::Reconnect => self.ctx.connection.on_reconnect_timer(id, &mut self.ctx.timers),
            TimerKind::StartupTimeout(SyncDomain::Configuration) => {
                self.configuration.on_startup_timeout(&mut self.ctx, id)
            }
            TimerKind::StartupTimeout(SyncDomain::Media) => {
                self.media.on_startup_timeout(&mut self.ctx, id)
            }
            TimerKind::ConfigurationRefresh => self.configuration.on_refresh_timer(&mut self.ctx, id),
        }
    }

    fn handle_message(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Response { id, outcome }) => {
                if let Some(completion) = self.ctx.dispatcher.on_response(&id, outcome) {
                    self.ctx.push_completion(completion);
                }
            }
            Ok(Inbound::Publish {
                topic,
                topic_name,
                params,
            }) => self.handle_publish(topic, &topic_name, params),
            Ok(Inbound::Request { method, id }) => {
                debug!(%method, ?id, "Ignoring server-initiated request");
            }
            Ok(Inbound::Unknown { kind }) => {
                warn!(kind, "Unknown message type");
            }
            Err(e) => warn!(error = %e, "Dropping malformed message"),
        }
    }

    fn handle_publish(&mut self, topic: Topic, topic_name: &str, params: Value) {
        debug!(topic = topic_name, "Publish received");
        match topic {
            Topic::Configuration => self.configuration.on_push(&mut self.ctx, &params),
            Topic::Media => self.media.on_list(&mut self.ctx, &params),
            Topic::ApplicationStatus => {}
            Topic::Unknown => {
                debug!(topic = topic_name, "Publish for unknown topic dropped");
                return;
            }
        }
        self.router.route(topic, &params);
    }

    fn apply_transition(&mut self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Connected) => {
                self.ctx.emit(SyncEvent::Connected);
                self.router.resubscribe_all(&mut self.ctx);
                self.configuration.on_connected(&mut self.ctx);
                self.media.on_connected(&mut self.ctx);
            }
            Some(Transition::Disconnected) => {
                for completion in self.ctx.dispatcher.fail_all(|| SyncError::Disconnected) {
                    self.ctx.push_completion(completion);
                }
                self.drain_completions();
                self.ctx.emit(SyncEvent::Disconnected);
            }
            None => {}
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                method,
                params,
                reply,
            } => {
                self.ctx.call(method, params, ResponseRoute::Caller(reply));
            }
            Command::Subscribe { topic, reply } => {
                let _ = reply.send(self.router.subscribe(&mut self.ctx, topic));
            }
            Command::Unsubscribe { topic, reply } => {
                let _ = reply.send(self.router.unsubscribe(&mut self.ctx, topic));
            }
            Command::Publish {
                topic,
                params,
                reply,
            } => {
                let _ = reply.send(self.router.publish(&self.ctx, topic, &params));
            }
            Command::Listen { topic, reply } => {
                let _ = reply.send(self.router.listen(topic));
            }
            Command::SaveConfiguration {
                system_configuration,
                applications,
                reply,
            } => {
                let result = self
                    .configuration
                    .save(&mut self.ctx, system_configuration, applications);
                let _ = reply.send(result);
            }
            Command::CurrentConfiguration { reply } => {
                let _ = reply.send(self.configuration.current().cloned());
            }
            Command::MediaAssets { reply } => {
                let _ = reply.send(self.media.assets());
            }
            Command::MediaPath { name, reply } => {
                let _ = reply.send(self.media.media_path(&name));
            }
            Command::TriggerConfigurationChanged => {
                self.configuration.trigger_configuration_changed(&mut self.ctx);
            }
            Command::SetServerUrl { url, reply } => {
                let result = match validate_url(&url, &["ws", "wss"], "Server URL") {
                    Ok(_) => {
                        self.persist_server_url(&url);
                        let transition = self.ctx.connection.set_url(url, &mut self.ctx.timers);
                        self.apply_transition(transition);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                // Handled in `run`.
                let _ = reply.send(());
            }
        }
    }

    /// Best effort: a failed write is logged and the switch goes ahead.
    fn persist_server_url(&mut self, url: &str) {
        if self.settings.server.url == url {
            return;
        }
        self.settings.server.url = url.to_string();
        match self.settings_store.save(&self.settings) {
            Ok(()) => info!(%url, "Server URL saved"),
            Err(e) => error!(%url, error = %e, "Failed to save server URL"),
        }
    }

    // =========================================================================
    // Settling
    // =========================================================================

    /// Hands every finished request to its route. Handlers may queue more.
    fn drain_completions(&mut self) {
        while let Some(completion) = self.ctx.next_completion() {
            match completion.route {
                ResponseRoute::Caller(reply) => {
                    let _ = reply.send(completion.outcome);
                }
                ResponseRoute::Subscription { topic, subscribe } => {
                    log_subscription_outcome(topic, subscribe, &completion.outcome);
                }
                ResponseRoute::Fetch(SyncDomain::Configuration) => {
                    self.configuration
                        .on_fetch_result(&mut self.ctx, completion.outcome);
                }
                ResponseRoute::Fetch(SyncDomain::Media) => {
                    self.media.on_fetch_result(&mut self.ctx, completion.outcome);
                }
            }
        }
    }

    fn settle(&mut self) {
        self.drain_completions();

        for event in self.ctx.drain_events() {
            debug!(?event, "Sync event");
            self.emitter.emit_event(&event);
        }

        let status = self.snapshot();
        if *self.status_tx.borrow() != status {
            self.emitter.emit_status(&status);
            self.status_tx.send_replace(status);
        }
    }

    fn snapshot(&self) -> SyncStatus {
        SyncStatus {
            connection: self.ctx.connection.state(),
            server_url: self.ctx.connection.url().to_string(),
            configuration: self.configuration.status(),
            media: self.media.status(),
        }
    }

    /// Cancels timers and downloads, closes the socket and fails every
    /// outstanding request with `ShuttingDown`.
    fn shutdown(&mut self) {
        info!("Sync engine shutting down");
        self.media.shutdown();
        let transition = self.ctx.connection.stop(&mut self.ctx.timers);
        self.ctx.timers.cancel_all();

        for completion in self.ctx.dispatcher.fail_all(|| SyncError::ShuttingDown) {
            self.ctx.push_completion(completion);
        }
        // Domain routes are done; only external callers hear about it.
        while let Some(completion) = self.ctx.next_completion() {
            if let ResponseRoute::Caller(reply) = completion.route {
                let _ = reply.send(completion.outcome);
            }
        }

        if transition.is_some() {
            self.ctx.emit(SyncEvent::Disconnected);
        }
        self.settle();
    }
}

/// Resolves with the new link state, or `None` once the source closes.
/// Never resolves when there is no source.
async fn link_changed(link: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match link {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncEngine`]. Every collaborator has a production default.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    connector: Option<Arc<dyn Connector>>,
    config_store: Option<Arc<dyn ConfigStore>>,
    media_store: Option<Arc<dyn MediaStore>>,
    transport: Option<Arc<dyn BulkTransport>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    link: Option<watch::Receiver<bool>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            connector: None,
            config_store: None,
            media_store: None,
            transport: None,
            settings_store: None,
            emitter: None,
            link: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn with_media_store(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.media_store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn BulkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where a changed server URL is written. Defaults to the TOML file in
    /// the platform config directory.
    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Link status source. Without one the link counts as always up.
    pub fn with_link(mut self, link: watch::Receiver<bool>) -> Self {
        self.link = Some(link);
        self
    }

    /// Builds the engine. Must be called inside a tokio runtime.
    pub fn build(self) -> SyncResult<(SyncEngine, SyncEngineHandle)> {
        let config = self.config;
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::from_config(&config)));
        let config_store = self
            .config_store
            .unwrap_or_else(|| Arc::new(JsonFileStore::new(&config.storage.configuration_dir)));
        let media_store = self
            .media_store
            .unwrap_or_else(|| Arc::new(DirMediaStore::new(config.storage.media_dir.clone())));
        let transport: Arc<dyn BulkTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpBulkTransport::from_config(&config)?),
        };
        let settings_store = self
            .settings_store
            .unwrap_or_else(|| Arc::new(TomlSettingsStore::default()));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let connection = ConnectionManager::new(
            connector,
            config.server_url(),
            config.reconnect_delay(),
            events_tx.clone(),
        );
        let ctx = SyncContext::new(connection, Timers::new(events_tx.clone()));
        let configuration = ConfigurationSync::from_config(&config, config_store);
        let media = MediaSync::from_config(&config, media_store, transport, events_tx);

        let (status_tx, status_rx) = watch::channel(SyncStatus {
            server_url: config.server_url().to_string(),
            ..SyncStatus::default()
        });

        let engine = SyncEngine {
            ctx,
            router: TopicRouter::new(),
            configuration,
            media,
            settings: config,
            settings_store,
            emitter,
            events_rx,
            commands_rx,
            link: self.link,
            status_tx,
        };
        let handle = SyncEngineHandle {
            commands: commands_tx,
            status: status_rx,
        };
        Ok((engine, handle))
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct SyncEngineHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncEngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Raw RPC. Fails with `NotConnected` immediately while offline.
    pub async fn call(&self, method: Method, params: Value) -> SyncResult<Value> {
        self.request(|reply| Command::Call {
            method,
            params,
            reply,
        })
        .await?
    }

    pub async fn subscribe(&self, topic: Topic) -> SyncResult<bool> {
        self.request(|reply| Command::Subscribe { topic, reply }).await?
    }

    pub async fn unsubscribe(&self, topic: Topic) -> SyncResult<bool> {
        self.request(|reply| Command::Unsubscribe { topic, reply }).await
    }

    /// Fire-and-forget publish. Returns false when it was dropped.
    pub async fn publish(&self, topic: Topic, params: Value) -> SyncResult<bool> {
        self.request(|reply| Command::Publish {
            topic,
            params,
            reply,
        })
        .await
    }

    /// Reports what the device is currently showing.
    pub async fn publish_application_status(&self, params: Value) -> SyncResult<bool> {
        self.publish(Topic::ApplicationStatus, params).await
    }

    /// Receives every publish payload for `topic` from now on.
    pub async fn listen(&self, topic: Topic) -> SyncResult<mpsc::UnboundedReceiver<Value>> {
        self.request(|reply| Command::Listen { topic, reply }).await
    }

    pub async fn save_configuration(
        &self,
        system_configuration: Map<String, Value>,
        applications: Vec<ApplicationDocument>,
    ) -> SyncResult<()> {
        self.request(|reply| Command::SaveConfiguration {
            system_configuration,
            applications,
            reply,
        })
        .await?
    }

    pub async fn current_configuration(&self) -> SyncResult<Option<DeviceConfiguration>> {
        self.request(|reply| Command::CurrentConfiguration { reply })
            .await
    }

    pub async fn media_assets(&self) -> SyncResult<Vec<MediaAsset>> {
        self.request(|reply| Command::MediaAssets { reply }).await
    }

    /// Local path for a media file, or the default media URI.
    pub async fn media_path(&self, name: impl Into<String>) -> SyncResult<String> {
        let name = name.into();
        self.request(|reply| Command::MediaPath { name, reply })
            .await
    }

    pub async fn trigger_configuration_changed(&self) -> SyncResult<()> {
        self.commands
            .send(Command::TriggerConfigurationChanged)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    pub async fn set_server_url(&self, url: impl Into<String>) -> SyncResult<()> {
        let url = url.into();
        self.request(|reply| Command::SetServerUrl { url, reply })
            .await?
    }

    /// Latest status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops the engine and waits for it to acknowledge.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
