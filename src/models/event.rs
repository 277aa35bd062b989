use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw push/poll tick for a single device: a map of telemetry keys to
/// shape-agnostic payloads. Payloads stay untyped until normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub entity_id: String,
    pub data: HashMap<String, Value>,
}

/// What a normalized telemetry value means to the session engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Hit,
    Start,
    Busy,
    Other,
}

impl EventKind {
    /// Classify a resolved telemetry value. Sensor targets report state as
    /// short string markers; anything unrecognized is `Other` so malformed
    /// payloads can never be mistaken for hits.
    pub fn from_value(value: &Value) -> Self {
        match value.as_str() {
            Some(s) if s.eq_ignore_ascii_case("hit") => EventKind::Hit,
            Some(s) if s.eq_ignore_ascii_case("start") => EventKind::Start,
            Some(s) if s.eq_ignore_ascii_case("busy") => EventKind::Busy,
            _ => EventKind::Other,
        }
    }
}

/// Output of the telemetry normalizer: one typed event for one device.
/// `timestamp` is the device-reported event time, never the arrival time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub device_id: String,
    pub kind: EventKind,
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}
