//! # Wire Protocol
//!
//! JSON envelopes exchanged with the backend over the WebSocket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Envelope Types                                     │
//! │                                                                         │
//! │  REQUEST (device → server)                                             │
//! │  ─────────────────────────                                             │
//! │  { jsonrpc:"2.0", type:"request", method, params, id:"17" }            │
//! │                                                                         │
//! │  RESPONSE (server → device)                                            │
//! │  ──────────────────────────                                            │
//! │  { jsonrpc:"2.0", type:"response", id:"17", result }                   │
//! │  { jsonrpc:"2.0", type:"response", id:"17", error:{ message } }        │
//! │                                                                         │
//! │  PUBLISH (either direction)                                            │
//! │  ──────────────────────────                                            │
//! │  { jsonrpc:"2.0", type:"publish", topic, params }                      │
//! │                                                                         │
//! │  METHODS: subscribe, unsubscribe, getConfig, getMedia                  │
//! │  TOPICS:  configuration, media, application-status                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound text is decoded into [`Inbound`] at this boundary. Unrecognised
//! message types and topics become explicit `Unknown` variants so the rest
//! of the engine only ever matches exhaustively.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// JSON-RPC version stamped on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Methods
// =============================================================================

/// RPC methods the device calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Subscribe,
    Unsubscribe,
    GetConfig,
    GetMedia,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::GetConfig => "getConfig",
            Method::GetMedia => "getMedia",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Topics
// =============================================================================

/// Named channels for server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Configuration,
    Media,
    ApplicationStatus,
    /// A topic this build does not know about.
    Unknown,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Configuration => "configuration",
            Topic::Media => "media",
            Topic::ApplicationStatus => "application-status",
            Topic::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Topic {
        match raw {
            "configuration" => Topic::Configuration,
            "media" => Topic::Media,
            "application-status" => Topic::ApplicationStatus,
            _ => Topic::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Topic::Unknown)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Message Types
// =============================================================================

/// The `type` field of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Publish,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Publish => "publish",
            MessageType::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> MessageType {
        match raw {
            "request" => MessageType::Request,
            "response" => MessageType::Response,
            "publish" => MessageType::Publish,
            _ => MessageType::Unknown,
        }
    }
}

// =============================================================================
// Request Ids
// =============================================================================

/// Correlation id. Allocated from a monotonic counter and sent as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Parses the wire form. Returns `None` for ids this client never issues.
    pub fn parse(raw: &str) -> Option<RequestId> {
        raw.trim().parse::<u64>().ok().map(RequestId)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Outbound Envelopes
// =============================================================================

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    method: Method,
    params: &'a Value,
    id: String,
}

#[derive(Serialize)]
struct PublishEnvelope<'a> {
    jsonrpc: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'static str,
    params: &'a Value,
}

/// Encodes a request envelope.
pub fn encode_request(id: RequestId, method: Method, params: &Value) -> SyncResult<String> {
    let envelope = RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        kind: MessageType::Request.as_str(),
        method,
        params,
        id: id.to_string(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encodes a publish envelope.
pub fn encode_publish(topic: Topic, params: &Value) -> SyncResult<String> {
    if !topic.is_known() {
        return Err(SyncError::InvalidMessage(
            "cannot publish to an unknown topic".into(),
        ));
    }
    let envelope = PublishEnvelope {
        jsonrpc: JSONRPC_VERSION,
        kind: MessageType::Publish.as_str(),
        topic: topic.as_str(),
        params,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Params for `subscribe` / `unsubscribe`.
pub fn topic_params(topic: Topic) -> Value {
    let mut params = Map::new();
    params.insert("topic".into(), Value::String(topic.as_str().into()));
    Value::Object(params)
}

// =============================================================================
// Inbound Envelopes
// =============================================================================

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests. `id` is the raw wire id.
    Response {
        id: String,
        outcome: Result<Value, String>,
    },

    /// Unsolicited push.
    Publish {
        topic: Topic,
        topic_name: String,
        params: Value,
    },

    /// Server-initiated request. Not served by this client.
    Request { method: String, id: Option<String> },

    /// Anything with an unrecognised `type`.
    Unknown { kind: String },
}

impl Inbound {
    /// Decodes one text frame.
    pub fn parse(text: &str) -> SyncResult<Inbound> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| SyncError::InvalidMessage("envelope is not a JSON object".into()))?;

        let kind = object.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match MessageType::parse(kind) {
            MessageType::Response => Inbound::Response {
                id: object.get("id").map(id_string).unwrap_or_default(),
                outcome: response_outcome(object),
            },
            MessageType::Publish => {
                let topic_name = object
                    .get("topic")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Inbound::Publish {
                    topic: Topic::parse(&topic_name),
                    topic_name,
                    params: object.get("params").cloned().unwrap_or(Value::Null),
                }
            }
            MessageType::Request => Inbound::Request {
                method: object
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                id: object.get("id").map(id_string),
            },
            MessageType::Unknown => Inbound::Unknown {
                kind: kind.to_string(),
            },
        })
    }
}

/// Ids are strings on the wire but some servers echo them as numbers.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn response_outcome(object: &Map<String, Value>) -> Result<Value, String> {
    match object.get("error") {
        Some(Value::Null) | None => Ok(object.get("result").cloned().unwrap_or(Value::Null)),
        Some(Value::Object(error)) => Err(error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string()),
        Some(Value::String(message)) => Err(message.clone()),
        Some(other) => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let frame = encode_request(RequestId(7), Method::GetConfig, &json!({ "device_id": "bee" })).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["type"], "request");
        assert_eq!(value["method"], "getConfig");
        assert_eq!(value["params"]["device_id"], "bee");
        assert_eq!(value["id"], "7");
    }

    #[test]
    fn test_publish_envelope_shape() {
        let frame = encode_publish(Topic::ApplicationStatus, &json!({ "app": "clock" })).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "publish");
        assert_eq!(value["topic"], "application-status");
        assert_eq!(value["params"]["app"], "clock");
        assert!(value.get("id").is_none());

        assert!(encode_publish(Topic::Unknown, &json!({})).is_err());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Subscribe.to_string(), "subscribe");
        assert_eq!(Method::GetMedia.to_string(), "getMedia");
        assert_eq!(serde_json::to_value(Method::GetConfig).unwrap(), json!("getConfig"));
    }

    #[test]
    fn test_topic_parsing() {
        assert_eq!(Topic::parse("configuration"), Topic::Configuration);
        assert_eq!(Topic::parse("media"), Topic::Media);
        assert_eq!(Topic::parse("application-status"), Topic::ApplicationStatus);
        assert_eq!(Topic::parse("weather"), Topic::Unknown);
        assert_eq!(topic_params(Topic::Media), json!({ "topic": "media" }));
    }

    #[test]
    fn test_parse_success_response() {
        let inbound = Inbound::parse(r#"{"jsonrpc":"2.0","type":"response","id":"3","result":{"ok":true}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response {
                id: "3".into(),
                outcome: Ok(json!({ "ok": true })),
            }
        );
    }

    #[test]
    fn test_parse_error_response() {
        let inbound = Inbound::parse(r#"{"type":"response","id":4,"error":{"message":"no such device"}}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response {
                id: "4".into(),
                outcome: Err("no such device".into()),
            }
        );
    }

    #[test]
    fn test_parse_publish_with_unknown_topic() {
        let inbound = Inbound::parse(r#"{"type":"publish","topic":"weather","params":{"t":21}}"#).unwrap();
        match inbound {
            Inbound::Publish { topic, topic_name, params } => {
                assert_eq!(topic, Topic::Unknown);
                assert_eq!(topic_name, "weather");
                assert_eq!(params["t"], 21);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_and_invalid() {
        assert_eq!(
            Inbound::parse(r#"{"type":"notify"}"#).unwrap(),
            Inbound::Unknown { kind: "notify".into() }
        );
        assert!(matches!(
            Inbound::parse("not json"),
            Err(SyncError::DeserializationFailed(_))
        ));
        assert!(matches!(
            Inbound::parse("[1,2]"),
            Err(SyncError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_request_id_parse() {
        assert_eq!(RequestId::parse("12"), Some(RequestId(12)));
        assert_eq!(RequestId::parse("abc"), None);
        assert!(RequestId(2) > RequestId(1));
    }
}
