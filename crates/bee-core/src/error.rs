//! # Error Types
//!
//! Domain-specific error types for bee-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  bee-core errors (this file)                                           │
//! │  └── CoreError        - Malformed documents and rejected names         │
//! │                                                                         │
//! │  bee-sync errors (separate crate)                                      │
//! │  └── SyncError        - Connection, RPC, storage, download failures    │
//! │                                                                         │
//! │  Flow: CoreError → SyncError::ValidationFailed → log / lastError       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting configuration documents or media names.
///
/// None of these are fatal to the device. The sync layer logs them and keeps
/// the previous authoritative state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A payload was not a JSON object.
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A payload is missing a field it must carry.
    ///
    /// ## When This Occurs
    /// - A pushed configuration without an `applications` array
    /// - A server response stripped by a proxy
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("Field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A media filename would escape the media directory.
    #[error("Unsafe media filename: {0}")]
    UnsafeFilename(String),

    /// JSON could not be decoded into the domain type.
    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::MissingField("applications");
        assert_eq!(err.to_string(), "Missing required field: applications");

        let err = CoreError::InvalidField {
            field: "applications",
            reason: "expected an array".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Field applications is invalid: expected an array"
        );
    }

    #[test]
    fn test_serde_error_converts_to_core_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let core_err: CoreError = serde_err.into();
        assert!(matches!(core_err, CoreError::Malformed(_)));
    }
}
