//! # bee-core: Pure Domain Model for the Bee Device Client
//!
//! This crate holds the data the device keeps in sync with the backend:
//! the device configuration document and the media asset set. Everything
//! here is pure; reading files, talking to the server and running timers
//! happen in `bee-sync`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bee Device Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    apps/bee-agent                               │   │
//! │  │     tracing init ──► config load ──► engine wiring ──► Ctrl-C  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    bee-sync (event loop)                        │   │
//! │  │   connection • dispatcher • router • startup • config • media  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ bee-core (THIS CRATE) ★                         │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────────────┐       ┌──────────────────────────┐  │   │
//! │  │   │   device_config      │       │   media                  │  │   │
//! │  │   │ DeviceConfiguration  │       │ MediaAsset, MediaModel   │  │   │
//! │  │   │ application helpers  │       │ ReconciliationPlan       │  │   │
//! │  │   └──────────────────────┘       └──────────────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`device_config`] - The device configuration document and its JSON form
//! - [`media`] - Media assets, the asset model and reconciliation planning
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use bee_core::media::{LocalFile, ReconciliationPlan, MIN_MEDIA_FILE_SIZE};
//!
//! let server = vec!["a.gif".to_string(), "b.png".to_string()];
//! let local = vec![LocalFile::new("b.png", 2000), LocalFile::new("old.gif", 2000)];
//!
//! let plan = ReconciliationPlan::compute(&server, &local, MIN_MEDIA_FILE_SIZE);
//! assert_eq!(plan.download, vec!["a.gif".to_string()]);
//! assert_eq!(plan.delete, vec!["old.gif".to_string()]);
//! assert_eq!(plan.keep, vec!["b.png".to_string()]);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod device_config;
pub mod error;
pub mod media;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use bee_core::DeviceConfiguration` instead of
// `use bee_core::device_config::DeviceConfiguration`

pub use device_config::DeviceConfiguration;
pub use error::{CoreError, CoreResult};
pub use media::{LocalFile, MediaAsset, MediaModel, ReconciliationPlan};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// File name of the persisted device configuration inside the configuration
/// directory.
pub const CONFIGURATION_FILE_NAME: &str = "configuration.json";

/// Version assigned to a configuration document that does not carry one.
pub const DEFAULT_CONFIGURATION_VERSION: &str = "1.0";
