//! # Topic Router
//!
//! Keeps the desired subscription set and fans inbound publishes out to
//! listeners.
//!
//! The desired set records what the device wants, not what the server
//! acknowledged. Subscribe and unsubscribe RPCs are fire-and-forget, and
//! every transition to Connected re-asserts the whole set.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::dispatcher::ResponseRoute;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{topic_params, Method, Topic};

#[derive(Debug, Default)]
pub struct TopicRouter {
    desired: BTreeSet<Topic>,
    listeners: HashMap<Topic, Vec<mpsc::UnboundedSender<Value>>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `topic` to the desired set and, when connected, sends a
    /// `subscribe`. Returns true if the topic was newly added.
    pub fn subscribe(&mut self, ctx: &mut SyncContext, topic: Topic) -> SyncResult<bool> {
        if !topic.is_known() {
            return Err(SyncError::InvalidMessage(
                "cannot subscribe to an unknown topic".into(),
            ));
        }

        let added = self.desired.insert(topic);
        if ctx.is_connected() {
            Self::request(ctx, Method::Subscribe, topic);
        } else {
            debug!(%topic, "Will subscribe when connected");
        }
        Ok(added)
    }

    /// Removes `topic` from the desired set. Returns false if it was not a
    /// member, in which case nothing is sent.
    pub fn unsubscribe(&mut self, ctx: &mut SyncContext, topic: Topic) -> bool {
        if !self.desired.remove(&topic) {
            return false;
        }
        if ctx.is_connected() {
            Self::request(ctx, Method::Unsubscribe, topic);
        }
        true
    }

    /// Sends one `subscribe` per desired topic. Called on every connect.
    pub fn resubscribe_all(&self, ctx: &mut SyncContext) -> usize {
        for &topic in &self.desired {
            Self::request(ctx, Method::Subscribe, topic);
        }
        if !self.desired.is_empty() {
            info!(count = self.desired.len(), "Resubscribed to topics");
        }
        self.desired.len()
    }

    /// Sends a publish if connected, otherwise drops it. Never queued.
    pub fn publish(&self, ctx: &SyncContext, topic: Topic, params: &Value) -> bool {
        if !ctx.is_connected() {
            warn!(%topic, "Not connected, dropping publish");
            return false;
        }
        match ctx.publish(topic, params) {
            Ok(()) => true,
            Err(e) => {
                warn!(%topic, error = %e, "Publish failed");
                false
            }
        }
    }

    /// Registers an external listener for a topic.
    pub fn listen(&mut self, topic: Topic) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.entry(topic).or_default().push(tx);
        rx
    }

    /// Delivers a publish payload to every live listener. Returns how many
    /// received it.
    pub fn route(&mut self, topic: Topic, params: &Value) -> usize {
        let Some(listeners) = self.listeners.get_mut(&topic) else {
            return 0;
        };
        listeners.retain(|tx| tx.send(params.clone()).is_ok());
        let delivered = listeners.len();
        if listeners.is_empty() {
            self.listeners.remove(&topic);
        }
        delivered
    }

    pub fn desired(&self) -> impl Iterator<Item = Topic> + '_ {
        self.desired.iter().copied()
    }

    pub fn is_desired(&self, topic: Topic) -> bool {
        self.desired.contains(&topic)
    }

    fn request(ctx: &mut SyncContext, method: Method, topic: Topic) {
        let subscribe = method == Method::Subscribe;
        ctx.call(
            method,
            topic_params(topic),
            ResponseRoute::Subscription { topic, subscribe },
        );
    }
}

/// Logs the outcome of a subscribe or unsubscribe.
pub(crate) fn log_subscription_outcome(topic: Topic, subscribe: bool, outcome: &SyncResult<Value>) {
    let action = if subscribe { "subscribe to" } else { "unsubscribe from" };
    match outcome {
        Ok(_) if subscribe => info!(%topic, "Subscribed to topic"),
        Ok(_) => info!(%topic, "Unsubscribed from topic"),
        Err(e) => warn!(%topic, error = %e, "Failed to {action} topic"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use serde_json::json;

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (mut ctx, _rx) = test_context();
        let mut router = TopicRouter::new();

        assert!(router.subscribe(&mut ctx, Topic::Configuration).unwrap());
        assert!(!router.subscribe(&mut ctx, Topic::Configuration).unwrap());
        assert_eq!(router.desired().collect::<Vec<_>>(), vec![Topic::Configuration]);

        // Offline: no RPC was attempted.
        assert!(ctx.next_completion().is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_non_member_is_noop() {
        let (mut ctx, _rx) = test_context();
        let mut frames = ctx.force_connected();
        let mut router = TopicRouter::new();

        assert!(!router.unsubscribe(&mut ctx, Topic::Media));
        assert!(drain_frames(&mut frames).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sends_rpc_when_connected() {
        let (mut ctx, _rx) = test_context();
        let mut frames = ctx.force_connected();
        let mut router = TopicRouter::new();

        router.subscribe(&mut ctx, Topic::Media).unwrap();
        router.unsubscribe(&mut ctx, Topic::Media);

        let frames = drain_frames(&mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["method"], "subscribe");
        assert_eq!(frames[0]["params"]["topic"], "media");
        assert_eq!(frames[1]["method"], "unsubscribe");
    }

    #[tokio::test]
    async fn test_unknown_topic_is_rejected() {
        let (mut ctx, _rx) = test_context();
        let mut router = TopicRouter::new();
        assert!(router.subscribe(&mut ctx, Topic::Unknown).is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_all_sends_one_per_topic() {
        let (mut ctx, _rx) = test_context();
        let mut router = TopicRouter::new();
        router.subscribe(&mut ctx, Topic::Configuration).unwrap();
        router.subscribe(&mut ctx, Topic::Media).unwrap();

        let mut frames = ctx.force_connected();
        assert_eq!(router.resubscribe_all(&mut ctx), 2);

        let topics: Vec<Value> = drain_frames(&mut frames)
            .into_iter()
            .map(|f| f["params"]["topic"].clone())
            .collect();
        assert_eq!(topics, vec![json!("configuration"), json!("media")]);
    }

    #[tokio::test]
    async fn test_publish_dropped_while_disconnected() {
        let (ctx, _rx) = test_context();
        let router = TopicRouter::new();
        assert!(!router.publish(&ctx, Topic::ApplicationStatus, &json!({"running": true})));
    }

    #[tokio::test]
    async fn test_route_fans_out_and_prunes_closed_listeners() {
        let mut router = TopicRouter::new();
        let mut first = router.listen(Topic::ApplicationStatus);
        let second = router.listen(Topic::ApplicationStatus);
        drop(second);

        let delivered = router.route(Topic::ApplicationStatus, &json!({"app": "timer"}));
        assert_eq!(delivered, 1);
        assert_eq!(first.recv().await.unwrap()["app"], "timer");

        assert_eq!(router.route(Topic::Media, &json!({})), 0);
    }
}
