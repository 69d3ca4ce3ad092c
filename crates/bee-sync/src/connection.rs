//! # Connection Manager
//!
//! Owns the one WebSocket to the backend: connects, reconnects after a
//! fixed delay, and follows the external link-status signal.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────┐  start()+link up  ┌────────────┐                            │
//! │  │  Idle  │ ────────────────► │ Connecting │ ◄─────────────────┐        │
//! │  └────────┘                   └─────┬──────┘                   │        │
//! │                           opened    │   failed                 │        │
//! │                         ┌───────────┴──────────┐               │        │
//! │                         ▼                      ▼               │        │
//! │                  ┌────────────┐   closed  ┌──────────────┐     │        │
//! │                  │ Connected  │ ────────► │ Disconnected │ ────┘        │
//! │                  └────────────┘           └──────────────┘  fixed delay │
//! │                                                             (5 s)       │
//! │                                                                         │
//! │  LINK DOWN (any state): cancel the delay, drop the socket, Disconnected │
//! │  LINK UP: connect immediately, no delay                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Generations
//! Every connect attempt and every teardown bumps a generation counter. The
//! session task tags its events with the generation it was started under,
//! and the loop drops events whose generation is no longer current. A late
//! message from a socket that was already torn down can therefore never
//! reach the dispatcher.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::engine::LoopEvent;
use crate::error::{SyncError, SyncResult};
use crate::timer::{TimerId, TimerKind, Timers};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state as observed by the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or stopped.
    #[default]
    Idle,
    /// Connect attempt in flight.
    Connecting,
    /// Socket open.
    Connected,
    /// Lost or failed; a reconnect may be scheduled.
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Edge observed by the loop after a connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

// =============================================================================
// Socket Events
// =============================================================================

/// Event reported by a session task, tagged with its generation.
#[derive(Debug)]
pub struct SocketEvent {
    pub(crate) generation: u64,
    pub(crate) kind: SocketEventKind,
}

#[derive(Debug)]
pub(crate) enum SocketEventKind {
    /// Handshake done; frames sent on this channel go out on the socket.
    Opened(mpsc::UnboundedSender<String>),
    /// A text frame arrived.
    Message(String),
    /// The attempt failed or the socket closed.
    Closed(String),
}

/// The session task's way back into the event loop.
pub struct SessionLink {
    generation: u64,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl SessionLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, kind: SocketEventKind) -> bool {
        self.events
            .send(LoopEvent::Socket(SocketEvent {
                generation: self.generation,
                kind,
            }))
            .is_ok()
    }

    /// Reports a successful handshake. Returns false once the loop is gone.
    pub fn opened(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        self.send(SocketEventKind::Opened(outbound))
    }

    /// Forwards one inbound text frame.
    pub fn message(&self, text: impl Into<String>) -> bool {
        self.send(SocketEventKind::Message(text.into()))
    }

    /// Reports that the attempt failed or the session ended.
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.send(SocketEventKind::Closed(reason.into()));
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens a socket and runs it until it closes.
///
/// Implementations call [`SessionLink::opened`] once connected, forward
/// every text frame with [`SessionLink::message`], and finish with
/// [`SessionLink::closed`]. The manager aborts the task on teardown, in
/// which case no `closed` is expected.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn run(&self, url: String, link: SessionLink);
}

/// Anything the dispatcher can write frames to.
pub trait FrameSink {
    fn is_connected(&self) -> bool;
    fn send_frame(&self, frame: String) -> SyncResult<()>;
}

// =============================================================================
// WebSocket Connector
// =============================================================================

/// Real WebSocket connector built on tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, ping_interval: Duration) -> Self {
        WsConnector {
            connect_timeout,
            ping_interval,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.connect_timeout(), config.ping_interval())
    }

    /// Pumps frames until either side closes.
    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        link: &SessionLink,
    ) -> SyncResult<()> {
        let (mut write, mut read) = stream.split();

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        write.send(WsMessage::Text(frame.into())).await?;
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return Ok(());
                    }
                },

                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !link.message(text.as_str()) {
                            return Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        debug!("Received pong");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(());
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("Received unexpected binary message");
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(?e, "WebSocket error");
                        return Err(SyncError::from(e));
                    }
                    None => return Err(SyncError::Disconnected),
                },

                _ = ping.tick() => {
                    write.send(WsMessage::Ping(Vec::new().into())).await?;
                    debug!("Sent ping");
                }
            }
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn run(&self, url: String, link: SessionLink) {
        debug!(url = %url, generation = link.generation(), "Connecting WebSocket");

        let stream = match timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                stream
            }
            Ok(Err(e)) => {
                link.closed(SyncError::from(e).to_string());
                return;
            }
            Err(_) => {
                link.closed(SyncError::Timeout(self.connect_timeout.as_secs()).to_string());
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if !link.opened(outbound_tx) {
            return;
        }

        let reason = match self.session(stream, outbound_rx, &link).await {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        link.closed(reason);
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns the connection state machine. Lives on the event loop.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    url: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    started: bool,
    link_up: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<JoinHandle<()>>,
    reconnect_timer: Option<TimerId>,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> Self {
        ConnectionManager {
            connector,
            url: url.into(),
            reconnect_delay,
            state: ConnectionState::Idle,
            started: false,
            link_up: false,
            generation: 0,
            outbound: None,
            session: None,
            reconnect_timer: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if an event tagged `generation` belongs to the live session.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Begins connecting as soon as the link is up.
    pub fn start(&mut self, link_up: bool, timers: &mut Timers) {
        self.started = true;
        self.link_up = link_up;
        if link_up {
            self.connect_now(timers);
        } else {
            info!(url = %self.url, "Waiting for network before connecting WebSocket");
        }
    }

    /// Tears everything down and cancels any scheduled reconnect.
    pub fn stop(&mut self, timers: &mut Timers) -> Option<Transition> {
        self.started = false;
        self.cancel_reconnect(timers);
        let transition = self.teardown();
        self.state = ConnectionState::Idle;
        info!("Connection manager stopped");
        transition
    }

    pub fn on_link_changed(&mut self, up: bool, timers: &mut Timers) -> Option<Transition> {
        if up == self.link_up {
            return None;
        }
        self.link_up = up;

        if up {
            info!("Network link up");
            if self.started {
                self.cancel_reconnect(timers);
                self.connect_now(timers);
            }
            None
        } else {
            warn!("Network link down");
            self.cancel_reconnect(timers);
            let transition = self.teardown();
            if self.started {
                self.state = ConnectionState::Disconnected;
            }
            transition
        }
    }

    /// Changes the server URL and reconnects if it actually changed.
    pub fn set_url(&mut self, url: impl Into<String>, timers: &mut Timers) -> Option<Transition> {
        let url = url.into();
        if url == self.url {
            return None;
        }
        info!(old = %self.url, new = %url, "Server URL changed");
        self.url = url;

        self.cancel_reconnect(timers);
        let transition = self.teardown();
        if self.started {
            self.state = ConnectionState::Disconnected;
            if self.link_up {
                self.connect_now(timers);
            }
        }
        transition
    }

    pub fn on_reconnect_timer(&mut self, id: TimerId, timers: &mut Timers) {
        if self.reconnect_timer != Some(id) {
            return;
        }
        self.reconnect_timer = None;
        if self.started && self.link_up {
            self.connect_now(timers);
        }
    }

    // =========================================================================
    // Session Events
    // =========================================================================

    pub(crate) fn on_opened(&mut self, outbound: mpsc::UnboundedSender<String>) -> Option<Transition> {
        info!(url = %self.url, "WebSocket connected");
        self.outbound = Some(outbound);
        self.state = ConnectionState::Connected;
        Some(Transition::Connected)
    }

    pub(crate) fn on_closed(&mut self, reason: &str, timers: &mut Timers) -> Option<Transition> {
        let was_connected = self.state == ConnectionState::Connected;
        if was_connected {
            info!(reason, "WebSocket disconnected");
        } else {
            warn!(url = %self.url, reason, "WebSocket connect attempt failed");
        }

        self.generation += 1;
        self.outbound = None;
        self.session = None;
        self.state = ConnectionState::Disconnected;

        if self.started && self.link_up {
            self.schedule_reconnect(timers);
        }

        was_connected.then_some(Transition::Disconnected)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn connect_now(&mut self, timers: &mut Timers) {
        self.cancel_reconnect(timers);
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return;
        }
        if self.url.is_empty() {
            warn!("No server URL configured, not connecting");
            return;
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;

        let link = SessionLink {
            generation: self.generation,
            events: self.events.clone(),
        };
        let connector = self.connector.clone();
        let url = self.url.clone();
        debug!(url = %url, generation = self.generation, "Starting connect attempt");
        self.session = Some(tokio::spawn(async move {
            connector.run(url, link).await;
        }));
    }

    fn schedule_reconnect(&mut self, timers: &mut Timers) {
        self.cancel_reconnect(timers);
        debug!(delay = ?self.reconnect_delay, "Scheduling reconnect");
        self.reconnect_timer = Some(timers.schedule(TimerKind::Reconnect, self.reconnect_delay));
    }

    fn cancel_reconnect(&mut self, timers: &mut Timers) {
        if let Some(id) = self.reconnect_timer.take() {
            timers.cancel(id);
        }
    }

    /// Drops the socket without reporting through the session task.
    fn teardown(&mut self) -> Option<Transition> {
        let was_connected = self.state == ConnectionState::Connected;
        self.generation += 1;
        self.outbound = None;
        if let Some(task) = self.session.take() {
            task.abort();
        }
        if self.state == ConnectionState::Connecting || was_connected {
            self.state = ConnectionState::Disconnected;
        }
        was_connected.then_some(Transition::Disconnected)
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.started = true;
        self.link_up = true;
        self.outbound = Some(tx);
        self.state = ConnectionState::Connected;
        rx
    }
}

impl FrameSink for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn send_frame(&self, frame: String) -> SyncResult<()> {
        match (&self.outbound, self.state) {
            (Some(outbound), ConnectionState::Connected) => {
                outbound.send(frame).map_err(|_| SyncError::Disconnected)
            }
            _ => Err(SyncError::NotConnected),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.session.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts attempts and reports each one as refused.
    struct RefusingConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn run(&self, _url: String, link: SessionLink) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            link.closed("connection refused");
        }
    }

    fn manager() -> (
        ConnectionManager,
        Timers,
        Arc<RefusingConnector>,
        mpsc::UnboundedReceiver<LoopEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(RefusingConnector {
            attempts: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(
            connector.clone(),
            "ws://127.0.0.1:5000/ws",
            Duration::from_secs(5),
            tx.clone(),
        );
        (manager, Timers::new(tx), connector, rx)
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_waits_for_link_before_connecting() {
        let (mut manager, mut timers, connector, _rx) = manager();

        manager.start(false, &mut timers);
        assert_eq!(manager.state(), ConnectionState::Idle);
        tokio::task::yield_now().await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        manager.on_link_changed(true, &mut timers);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_schedules_fixed_delay_reconnect() {
        let (mut manager, mut timers, _connector, mut rx) = manager();
        manager.start(true, &mut timers);

        let event = match rx.recv().await {
            Some(LoopEvent::Socket(event)) => event,
            _ => panic!("expected a socket event"),
        };
        assert!(manager.is_current(event.generation));
        let reason = match event.kind {
            SocketEventKind::Closed(reason) => reason,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(manager.on_closed(&reason, &mut timers), None);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.has_pending_reconnect());

        let started = Instant::now();
        let id = match rx.recv().await {
            Some(LoopEvent::Timer(id)) => id,
            _ => panic!("expected the reconnect timer"),
        };
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(timers.fire(id), Some(TimerKind::Reconnect));

        manager.on_reconnect_timer(id, &mut timers);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_link_down_cancels_pending_reconnect() {
        let (mut manager, mut timers, _connector, _rx) = manager();
        let _frames = manager.force_connected();

        let transition = manager.on_closed("server went away", &mut timers);
        assert_eq!(transition, Some(Transition::Disconnected));
        assert!(manager.has_pending_reconnect());
        assert_eq!(timers.active_count(), 1);

        assert_eq!(manager.on_link_changed(false, &mut timers), None);
        assert!(!manager.has_pending_reconnect());
        assert_eq!(timers.active_count(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_down_while_connected_reports_disconnect() {
        let (mut manager, mut timers, _connector, _rx) = manager();
        let _frames = manager.force_connected();
        let generation = manager.generation();

        let transition = manager.on_link_changed(false, &mut timers);
        assert_eq!(transition, Some(Transition::Disconnected));
        assert!(!manager.is_current(generation));
        assert!(matches!(
            manager.send_frame("{}".into()),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (mut manager, _timers, _connector, _rx) = manager();
        assert!(matches!(
            manager.send_frame("{}".into()),
            Err(SyncError::NotConnected)
        ));

        let mut frames = manager.force_connected();
        manager.send_frame("hello".into()).unwrap();
        assert_eq!(frames.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_set_url_reconnects_only_on_change() {
        let (mut manager, mut timers, _connector, _rx) = manager();
        let _frames = manager.force_connected();

        assert_eq!(manager.set_url("ws://127.0.0.1:5000/ws", &mut timers), None);
        assert_eq!(manager.state(), ConnectionState::Connected);

        let transition = manager.set_url("ws://10.0.0.9:5000/ws", &mut timers);
        assert_eq!(transition, Some(Transition::Disconnected));
        assert_eq!(manager.url(), "ws://10.0.0.9:5000/ws");
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_stop_returns_to_idle() {
        let (mut manager, mut timers, _connector, _rx) = manager();
        let _frames = manager.force_connected();

        assert_eq!(manager.stop(&mut timers), Some(Transition::Disconnected));
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!manager.has_pending_reconnect());
    }
}
