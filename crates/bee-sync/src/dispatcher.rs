//! # Request Dispatcher
//!
//! Correlated request/response over the shared connection.
//!
//! ```text
//! call(method, params, route)
//!     │
//!     ├── not connected ──► Completion { Err(NotConnected) }   (no wire I/O)
//!     │
//!     └── id = next_id++ ──► pending[id] = route ──► frame out
//!
//! response { id, result | error }
//!     │
//!     ├── pending[id] ──► remove ──► Completion { Ok(result) | Err(RequestFailed) }
//!     └── unknown id  ──► log, drop
//!
//! disconnect ──► every pending entry ──► Completion { Err(Disconnected) }
//! ```
//!
//! The dispatcher never retries. Whoever owns the route decides.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::FrameSink;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{encode_request, Method, RequestId, Topic};
use crate::startup::SyncDomain;

/// Where a response goes once it arrives.
#[derive(Debug)]
pub enum ResponseRoute {
    /// An external caller awaiting the raw result.
    Caller(oneshot::Sender<SyncResult<Value>>),
    /// Fire-and-forget subscribe or unsubscribe; outcome is only logged.
    Subscription { topic: Topic, subscribe: bool },
    /// A domain fetch (`getConfig` / `getMedia`).
    Fetch(SyncDomain),
}

/// A finished request, ready to hand to its route.
#[derive(Debug)]
pub struct Completion {
    pub method: Method,
    pub route: ResponseRoute,
    pub outcome: SyncResult<Value>,
}

impl Completion {
    fn failed(method: Method, route: ResponseRoute, error: SyncError) -> Self {
        Completion {
            method,
            route,
            outcome: Err(error),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    method: Method,
    route: ResponseRoute,
    created_at: Instant,
}

/// Tracks outstanding requests by correlation id.
#[derive(Debug)]
pub struct RequestDispatcher {
    next_id: u64,
    pending: BTreeMap<RequestId, PendingRequest>,
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher {
    pub fn new() -> Self {
        RequestDispatcher {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Sends a request. On any failure before the frame leaves, the
    /// completion is handed straight back.
    pub fn call<S: FrameSink + ?Sized>(
        &mut self,
        sink: &S,
        method: Method,
        params: Value,
        route: ResponseRoute,
    ) -> Result<RequestId, Completion> {
        if !sink.is_connected() {
            warn!(%method, "Request rejected: not connected");
            return Err(Completion::failed(method, route, SyncError::NotConnected));
        }

        let id = RequestId(self.next_id);
        self.next_id += 1;

        let frame = match encode_request(id, method, &params) {
            Ok(frame) => frame,
            Err(e) => return Err(Completion::failed(method, route, e)),
        };

        if let Err(e) = sink.send_frame(frame) {
            warn!(%id, %method, error = %e, "Failed to send request");
            return Err(Completion::failed(method, route, e));
        }

        debug!(%id, %method, "Request sent");
        self.pending.insert(
            id,
            PendingRequest {
                method,
                route,
                created_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Resolves a response. Unknown ids are logged and dropped.
    pub fn on_response(&mut self, raw_id: &str, outcome: Result<Value, String>) -> Option<Completion> {
        let Some(pending) = RequestId::parse(raw_id).and_then(|id| self.pending.remove(&id)) else {
            warn!(id = raw_id, "{}", SyncError::UnknownRequestId(raw_id.to_string()));
            return None;
        };

        debug!(
            id = raw_id,
            method = %pending.method,
            elapsed = ?pending.created_at.elapsed(),
            ok = outcome.is_ok(),
            "Response received"
        );

        Some(Completion {
            method: pending.method,
            route: pending.route,
            outcome: outcome.map_err(SyncError::RequestFailed),
        })
    }

    /// Fails every outstanding request, oldest first, and clears the map.
    pub fn fail_all(&mut self, error: impl Fn() -> SyncError) -> Vec<Completion> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing outstanding requests");
        }
        pending
            .into_values()
            .map(|p| Completion::failed(p.method, p.route, error()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingSink {
        connected: bool,
        frames: RefCell<Vec<String>>,
    }

    impl RecordingSink {
        fn new(connected: bool) -> Self {
            RecordingSink {
                connected,
                frames: RefCell::new(Vec::new()),
            }
        }

        fn frame(&self, index: usize) -> Value {
            serde_json::from_str(&self.frames.borrow()[index]).unwrap()
        }
    }

    impl FrameSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send_frame(&self, frame: String) -> SyncResult<()> {
            self.frames.borrow_mut().push(frame);
            Ok(())
        }
    }

    fn fetch_route() -> ResponseRoute {
        ResponseRoute::Fetch(SyncDomain::Configuration)
    }

    #[test]
    fn test_not_connected_fails_without_wire_io() {
        let sink = RecordingSink::new(false);
        let mut dispatcher = RequestDispatcher::new();

        let rejected = dispatcher
            .call(&sink, Method::GetConfig, Value::Null, fetch_route())
            .unwrap_err();

        assert!(matches!(rejected.outcome, Err(SyncError::NotConnected)));
        assert!(sink.frames.borrow().is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let sink = RecordingSink::new(true);
        let mut dispatcher = RequestDispatcher::new();

        let first = dispatcher
            .call(&sink, Method::GetConfig, Value::Null, fetch_route())
            .unwrap();
        let second = dispatcher
            .call(&sink, Method::GetMedia, Value::Null, fetch_route())
            .unwrap();

        assert!(second > first);
        assert_eq!(dispatcher.pending_count(), 2);
        assert_eq!(sink.frame(0)["id"], first.to_string());
        assert_eq!(sink.frame(1)["method"], "getMedia");
    }

    #[test]
    fn test_response_resolves_exactly_once() {
        let sink = RecordingSink::new(true);
        let mut dispatcher = RequestDispatcher::new();
        let (tx, mut rx) = oneshot::channel();

        let id = dispatcher
            .call(&sink, Method::GetConfig, Value::Null, ResponseRoute::Caller(tx))
            .unwrap();

        let completion = dispatcher
            .on_response(&id.to_string(), Ok(serde_json::json!({"version": "1"})))
            .unwrap();
        assert!(dispatcher.on_response(&id.to_string(), Ok(Value::Null)).is_none());

        match completion.route {
            ResponseRoute::Caller(reply) => reply.send(completion.outcome).unwrap(),
            other => panic!("unexpected route {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap().unwrap()["version"], "1");
    }

    #[test]
    fn test_error_response_becomes_request_failed() {
        let sink = RecordingSink::new(true);
        let mut dispatcher = RequestDispatcher::new();

        let id = dispatcher
            .call(&sink, Method::GetMedia, Value::Null, fetch_route())
            .unwrap();
        let completion = dispatcher
            .on_response(&id.to_string(), Err("no such device".into()))
            .unwrap();

        match completion.outcome {
            Err(SyncError::RequestFailed(message)) => assert_eq!(message, "no such device"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_unknown_ids_are_dropped() {
        let mut dispatcher = RequestDispatcher::new();
        assert!(dispatcher.on_response("42", Ok(Value::Null)).is_none());
        assert!(dispatcher.on_response("not-a-number", Ok(Value::Null)).is_none());
    }

    #[test]
    fn test_fail_all_drains_in_id_order() {
        let sink = RecordingSink::new(true);
        let mut dispatcher = RequestDispatcher::new();

        dispatcher
            .call(&sink, Method::GetConfig, Value::Null, fetch_route())
            .unwrap();
        dispatcher
            .call(&sink, Method::GetMedia, Value::Null, fetch_route())
            .unwrap();

        let failed = dispatcher.fail_all(|| SyncError::Disconnected);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].method, Method::GetConfig);
        assert_eq!(failed[1].method, Method::GetMedia);
        assert!(failed
            .iter()
            .all(|c| matches!(c.outcome, Err(SyncError::Disconnected))));
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
