//! Session summary construction: a pure fold over the pipeline's final
//! state and the controller's session metadata. Missing optional inputs
//! resolve through fallback chains; nothing in here can fail.

mod types;

pub use types::{CrossTargetStats, DeviceResult, SessionSummary, TargetStats};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::Device;
use crate::pipeline::PipelineSnapshot;
use crate::session::SessionState;

/// Fold a finished session into its immutable summary.
///
/// `state` still carries session bookkeeping (the caller clears it after
/// this returns); `devices` is the tracked-device registry used to resolve
/// display names.
pub fn build_summary(
    state: &SessionState,
    snapshot: &PipelineSnapshot,
    devices: &HashMap<String, Device>,
    end_time: DateTime<Utc>,
) -> SessionSummary {
    let game_id = state
        .session_id
        .clone()
        .or_else(|| snapshot.session_id.clone())
        .unwrap_or_default();

    // Start time fallback chain: command-reported start, then the earliest
    // ready marker, then the end time itself (zero-length session).
    let start_time = state
        .started_at
        .or(snapshot.session_anchor)
        .unwrap_or(end_time);

    let total_hits: u32 = snapshot.hit_counts.values().sum();

    let device_results = state
        .target_device_ids
        .iter()
        .map(|id| {
            let hit_count = snapshot.hit_counts.get(id).copied().unwrap_or(0);
            let goal = state.goal_shots_per_target.get(id).copied();
            DeviceResult {
                device_id: id.clone(),
                device_name: display_name(devices, id),
                hit_count,
                goal,
                goal_reached: goal.map(|g| hit_count >= g).unwrap_or(false),
            }
        })
        .collect();

    let target_stats = state
        .target_device_ids
        .iter()
        .map(|id| per_target_stats(id, &display_name(devices, id), snapshot))
        .collect();

    SessionSummary {
        game_id,
        game_name: state.game_name.clone(),
        start_time,
        end_time,
        total_hits,
        actual_duration_secs: actual_duration_secs(
            state.started_at,
            state.stopped_at.or(Some(end_time)),
            state.duration_secs,
        ),
        device_results,
        target_stats,
        cross_target_stats: cross_target_stats(snapshot),
        splits: snapshot.splits.clone(),
        transitions: snapshot.transitions.clone(),
        hit_history: snapshot.hit_history.clone(),
        context: state.context.clone(),
    }
}

fn display_name(devices: &HashMap<String, Device>, device_id: &str) -> String {
    devices
        .get(device_id)
        .map(|d| d.display_name.clone())
        .unwrap_or_else(|| device_id.to_string())
}

/// Duration fallback chain: explicit stop−start delta, then the configured
/// duration, then zero. Negative deltas (skewed inputs) fall through.
fn actual_duration_secs(
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    configured_secs: Option<u32>,
) -> f64 {
    if let (Some(start), Some(stop)) = (started_at, stopped_at) {
        if stop >= start {
            return (stop - start).num_milliseconds() as f64 / 1000.0;
        }
    }
    configured_secs.map(f64::from).unwrap_or(0.0)
}

fn per_target_stats(device_id: &str, device_name: &str, snapshot: &PipelineSnapshot) -> TargetStats {
    let times = snapshot
        .hit_times_by_device
        .get(device_id)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let device_splits: Vec<f64> = snapshot
        .splits
        .iter()
        .filter(|s| s.device_id == device_id)
        .map(|s| s.time_secs)
        .collect();

    TargetStats {
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        hit_count: snapshot.hit_counts.get(device_id).copied().unwrap_or(0),
        first_hit: times.iter().min().copied(),
        last_hit: times.iter().max().copied(),
        best_split_secs: device_splits
            .iter()
            .copied()
            .fold(None, |best: Option<f64>, t| {
                Some(best.map_or(t, |b| b.min(t)))
            }),
        avg_split_secs: average(&device_splits),
    }
}

fn cross_target_stats(snapshot: &PipelineSnapshot) -> CrossTargetStats {
    let times: Vec<f64> = snapshot.transitions.iter().map(|t| t.time_secs).collect();
    CrossTargetStats {
        switch_count: snapshot.transitions.len() as u32,
        avg_transition_secs: average(&times),
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
