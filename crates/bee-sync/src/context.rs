//! # Loop Context
//!
//! The shared machinery every component on the event loop reaches for:
//! the connection, the dispatcher, the timers, and the queues of finished
//! requests and pending events. Components borrow it mutably for the
//! duration of one handler; nothing here is shared across tasks.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::connection::{ConnectionManager, FrameSink};
use crate::dispatcher::{Completion, RequestDispatcher, ResponseRoute};
use crate::error::SyncResult;
use crate::protocol::{encode_publish, Method, RequestId, Topic};
use crate::status::SyncEvent;
use crate::timer::{TimerId, TimerKind, Timers};

pub struct SyncContext {
    pub(crate) connection: ConnectionManager,
    pub(crate) dispatcher: RequestDispatcher,
    pub(crate) timers: Timers,
    completions: VecDeque<Completion>,
    events: Vec<SyncEvent>,
}

impl SyncContext {
    pub fn new(connection: ConnectionManager, timers: Timers) -> Self {
        SyncContext {
            connection,
            dispatcher: RequestDispatcher::new(),
            timers,
            completions: VecDeque::new(),
            events: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Issues a request. A rejected call is queued as a completion so that
    /// its route sees the failure on the same path as a server error.
    pub fn call(&mut self, method: Method, params: Value, route: ResponseRoute) -> Option<RequestId> {
        match self.dispatcher.call(&self.connection, method, params, route) {
            Ok(id) => Some(id),
            Err(completion) => {
                self.completions.push_back(completion);
                None
            }
        }
    }

    /// Sends a publish envelope, fire-and-forget.
    pub fn publish(&self, topic: Topic, params: &Value) -> SyncResult<()> {
        let frame = encode_publish(topic, params)?;
        self.connection.send_frame(frame)?;
        debug!(%topic, "Published");
        Ok(())
    }

    pub fn schedule(&mut self, kind: TimerKind, after: Duration) -> TimerId {
        self.timers.schedule(kind, after)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    pub fn emit(&mut self, event: SyncEvent) {
        self.events.push(event);
    }

    pub fn push_completion(&mut self, completion: Completion) {
        self.completions.push_back(completion);
    }

    pub fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        self.connection.force_connected()
    }
}

/// A context whose connector never connects, for unit tests.
#[cfg(test)]
pub(crate) fn test_context() -> (SyncContext, tokio::sync::mpsc::UnboundedReceiver<crate::engine::LoopEvent>) {
    use crate::connection::{Connector, SessionLink};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct SilentConnector;

    #[async_trait]
    impl Connector for SilentConnector {
        async fn run(&self, _url: String, _link: SessionLink) {
            std::future::pending::<()>().await;
        }
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let connection = ConnectionManager::new(
        Arc::new(SilentConnector),
        "ws://127.0.0.1:5000/ws",
        Duration::from_secs(5),
        tx.clone(),
    );
    (SyncContext::new(connection, Timers::new(tx)), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;

    #[tokio::test]
    async fn test_rejected_call_is_queued_as_completion() {
        let (mut ctx, _rx) = test_context();

        let id = ctx.call(Method::GetConfig, json!({}), ResponseRoute::Fetch(crate::startup::SyncDomain::Configuration));
        assert!(id.is_none());

        let completion = ctx.next_completion().unwrap();
        assert!(matches!(completion.outcome, Err(SyncError::NotConnected)));
        assert!(ctx.next_completion().is_none());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let (mut ctx, _rx) = test_context();
        assert!(matches!(
            ctx.publish(Topic::ApplicationStatus, &json!({"app": "clock"})),
            Err(SyncError::NotConnected)
        ));

        let mut frames = ctx.force_connected();
        ctx.publish(Topic::ApplicationStatus, &json!({"app": "clock"})).unwrap();
        let frame: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "publish");
        assert_eq!(frame["topic"], "application-status");
        assert_eq!(frame["params"]["app"], "clock");
    }

    #[test]
    fn test_events_drain_in_order() {
        let (mut ctx, _rx) = test_context();
        ctx.emit(SyncEvent::Connected);
        ctx.emit(SyncEvent::ConfigurationChanged);

        assert_eq!(
            ctx.drain_events(),
            vec![SyncEvent::Connected, SyncEvent::ConfigurationChanged]
        );
        assert!(ctx.drain_events().is_empty());
    }
}
