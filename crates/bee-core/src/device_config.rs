//! # Device Configuration
//!
//! The configuration document the backend owns and the device mirrors.
//!
//! ## Document Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      configuration.json                                 │
//! │                                                                         │
//! │  {                                                                      │
//! │    "version": "7",                    ◄── compared to detect changes    │
//! │    "device_id": "bee-0042",           ◄── required for is_valid()       │
//! │    "last_modified": "2024-03-01T10:00:00Z",                             │
//! │    "active_app_id": "clock-1",                                          │
//! │    "system-configuration": { ... },   ◄── opaque to the sync layer      │
//! │    "applications": [                  ◄── opaque objects, ordered       │
//! │      { "id", "type", "name", "order", "watchface", ... },               │
//! │      ...                                                                │
//! │    ]                                                                    │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reading is forgiving in the same places the device firmware always was:
//! a missing version becomes `"1.0"`, non-object application entries are
//! skipped, and timestamps without a UTC offset are read as UTC.
//!
//! Pushed payloads go through [`DeviceConfiguration::from_payload`], which
//! additionally requires the `applications` array to be present.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::DEFAULT_CONFIGURATION_VERSION;

/// Field whose presence marks a payload as a configuration document.
pub const VALIDATION_MARKER: &str = "applications";

/// One application entry. The sync layer only looks at `id`, `type` and
/// `order`; everything else belongs to the application itself.
pub type ApplicationDocument = Map<String, Value>;

// =============================================================================
// Device Configuration
// =============================================================================

/// The complete configuration for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Server-assigned version. Any difference counts as a change.
    #[serde(default = "default_version", deserialize_with = "version_string")]
    pub version: String,

    /// Device this document belongs to.
    #[serde(
        default,
        deserialize_with = "string_or_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub device_id: String,

    /// When the document was last modified.
    #[serde(
        default,
        with = "iso8601",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,

    /// Application shown on boot.
    #[serde(
        default,
        deserialize_with = "string_or_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub active_app_id: String,

    /// System-wide settings (brightness, volume, colours, ...).
    #[serde(
        rename = "system-configuration",
        default,
        deserialize_with = "object_or_empty",
        skip_serializing_if = "Map::is_empty"
    )]
    pub system_configuration: Map<String, Value>,

    /// Per-application documents in display order.
    #[serde(default, deserialize_with = "object_list")]
    pub applications: Vec<ApplicationDocument>,
}

fn default_version() -> String {
    DEFAULT_CONFIGURATION_VERSION.to_string()
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        DeviceConfiguration {
            version: default_version(),
            device_id: String::new(),
            last_modified: None,
            active_app_id: String::new(),
            system_configuration: Map::new(),
            applications: Vec::new(),
        }
    }
}

impl DeviceConfiguration {
    /// Creates an empty configuration stamped with the current time.
    pub fn new() -> Self {
        DeviceConfiguration {
            last_modified: Some(Utc::now()),
            ..Default::default()
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Accepts a payload pushed or returned by the server.
    ///
    /// Rejects anything that is not an object carrying an `applications`
    /// array; the caller keeps its previous configuration in that case.
    pub fn from_payload(payload: &Value) -> CoreResult<Self> {
        let object = payload
            .as_object()
            .ok_or(CoreError::NotAnObject(json_kind(payload)))?;

        match object.get(VALIDATION_MARKER) {
            None => Err(CoreError::MissingField(VALIDATION_MARKER)),
            Some(Value::Array(_)) => Self::from_json(payload.clone()),
            Some(other) => Err(CoreError::InvalidField {
                field: VALIDATION_MARKER,
                reason: format!("expected an array, got {}", json_kind(other)),
            }),
        }
    }

    /// Decodes a configuration document without the payload marker check.
    pub fn from_json(value: Value) -> CoreResult<Self> {
        if !value.is_object() {
            return Err(CoreError::NotAnObject(json_kind(&value)));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Decodes a configuration document from text.
    pub fn from_json_str(text: &str) -> CoreResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(value)
    }

    /// Encodes the document as a JSON value.
    pub fn to_json(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Encodes the document as indented JSON, the on-disk form.
    pub fn to_json_pretty(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// A configuration is usable once it names a version and a device.
    pub fn is_valid(&self) -> bool {
        !self.version.is_empty() && !self.device_id.is_empty()
    }

    pub fn application_count(&self) -> usize {
        self.applications.len()
    }

    pub fn has_applications(&self) -> bool {
        !self.applications.is_empty()
    }

    /// Finds an application by its `id` field.
    pub fn find_application(&self, app_id: &str) -> Option<&ApplicationDocument> {
        self.applications
            .iter()
            .find(|app| application_id(app) == Some(app_id))
    }

    /// Finds the first application with the given `type` field.
    pub fn find_application_by_type(&self, type_name: &str) -> Option<&ApplicationDocument> {
        self.applications
            .iter()
            .find(|app| string_field(app, "type") == Some(type_name))
    }

    // =========================================================================
    // Editing
    // =========================================================================
    // Each edit stamps last_modified, mirroring what the backend does.

    /// Appends an application document.
    pub fn add_application(&mut self, app: ApplicationDocument) {
        self.applications.push(app);
        self.touch();
    }

    /// Removes every application with the given id. Returns true if any
    /// entry was removed.
    pub fn remove_application(&mut self, app_id: &str) -> bool {
        let before = self.applications.len();
        self.applications
            .retain(|app| application_id(app) != Some(app_id));
        let removed = self.applications.len() != before;
        self.touch();
        removed
    }

    /// Replaces the application with the same id, or appends it.
    pub fn update_application(&mut self, app: ApplicationDocument) {
        let app_id = application_id(&app).map(str::to_owned);
        let existing = self
            .applications
            .iter_mut()
            .find(|candidate| application_id(candidate).map(str::to_owned) == app_id);

        match existing {
            Some(slot) => {
                *slot = app;
                self.touch();
            }
            None => self.add_application(app),
        }
    }

    /// Stable sort by the numeric `order` field. Entries without one sort
    /// as order 0.
    pub fn sort_applications_by_order(&mut self) {
        self.applications.sort_by_key(application_order);
    }

    fn touch(&mut self) {
        self.last_modified = Some(Utc::now());
    }
}

// =============================================================================
// Application Field Access
// =============================================================================

/// Returns the `id` of an application document.
pub fn application_id(app: &ApplicationDocument) -> Option<&str> {
    string_field(app, "id")
}

/// Returns the `order` of an application document (0 when absent).
pub fn application_order(app: &ApplicationDocument) -> i64 {
    match app.get("order") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

fn string_field<'a>(app: &'a ApplicationDocument, key: &str) -> Option<&'a str> {
    app.get(key).and_then(Value::as_str)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Parses an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Formats a timestamp the way it is written to disk.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

mod iso8601 {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
    }
}

// =============================================================================
// Lenient Field Decoders
// =============================================================================

fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => default_version(),
    })
}

fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

fn object_list<'de, D>(deserializer: D) -> Result<Vec<ApplicationDocument>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
