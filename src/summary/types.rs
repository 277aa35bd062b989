use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{HitRecord, SplitRecord, TransitionRecord};

/// Per-device outcome line for the scored summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResult {
    pub device_id: String,
    pub device_name: String,
    pub hit_count: u32,
    pub goal: Option<u32>,
    pub goal_reached: bool,
}

/// Hit-timing statistics for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStats {
    pub device_id: String,
    pub device_name: String,
    pub hit_count: u32,
    pub first_hit: Option<DateTime<Utc>>,
    pub last_hit: Option<DateTime<Utc>>,
    pub best_split_secs: Option<f64>,
    pub avg_split_secs: Option<f64>,
}

/// Cross-device movement statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTargetStats {
    pub switch_count: u32,
    pub avg_transition_secs: Option<f64>,
}

/// Immutable scored record of one completed session, handed to the
/// persistence collaborator. `context` is opaque passthrough (room id/name,
/// preset id, desired duration) and must round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub game_id: String,
    pub game_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_hits: u32,
    pub actual_duration_secs: f64,
    pub device_results: Vec<DeviceResult>,
    pub target_stats: Vec<TargetStats>,
    pub cross_target_stats: CrossTargetStats,
    pub splits: Vec<SplitRecord>,
    pub transitions: Vec<TransitionRecord>,
    pub hit_history: Vec<HitRecord>,
    #[serde(default)]
    pub context: Value,
}
