//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Connection    │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  ConnectionFail │  │  InvalidMessage         │ │
//! │  │  MissingDeviceId│  │  NotConnected   │  │  UnknownRequestId       │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Requests     │  │     Domain      │  │      Storage            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  RequestFailed  │  │ ValidationFailed│  │  StorageFailed          │ │
//! │  │  (server error) │  │ DownloadFailed  │  │  Http                   │ │
//! │  │                 │  │ StartupTimeout  │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here terminates the process. Connection failures stay inside the
//! reconnect loop; request failures go to the one caller that asked.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Invalid server or media URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// Could not establish or keep the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A request was attempted while the connection is down.
    #[error("WebSocket not connected")]
    NotConnected,

    /// The connection dropped while the request was outstanding.
    #[error("WebSocket disconnected")]
    Disconnected,

    /// Connection timeout.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A response carried an id with no outstanding request.
    #[error("Response for unknown request id: {0}")]
    UnknownRequestId(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// The server answered a request with an error object.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// A pushed or fetched payload was rejected.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// One media download failed.
    #[error("Download of {filename} failed: {reason}")]
    DownloadFailed { filename: String, reason: String },

    /// At least one download of a batch failed.
    #[error("Some downloads failed: {}", .failed.join(", "))]
    DownloadsIncomplete { failed: Vec<String> },

    /// Startup gave up waiting for the server. Informational only.
    #[error("{domain} startup check timed out after {after_ms} ms")]
    StartupTimeout { domain: String, after_ms: u64 },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Reading or writing local state failed.
    #[error("Storage error: {0}")]
    StorageFailed(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<bee_core::CoreError> for SyncError {
    fn from(err: bee_core::CoreError) -> Self {
        SyncError::ValidationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Http(format!("timed out: {err}"))
        } else {
            SyncError::Http(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::StorageFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}
