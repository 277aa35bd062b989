use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single confirmed sensor trigger. Immutable once appended to session
/// history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HitRecord {
    pub device_id: String,
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

/// Elapsed time between two consecutive hits on the same device.
/// `split_number` counts splits across the whole session, in accept order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SplitRecord {
    pub device_id: String,
    pub device_name: String,
    pub split_number: u32,
    pub time_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Elapsed time between the most recent hit on one device and the next hit
/// on a different device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from_device: String,
    pub to_device: String,
    pub from_device_name: String,
    pub to_device_name: String,
    pub transition_number: u32,
    pub time_secs: f64,
    pub timestamp: DateTime<Utc>,
}
