//! Engine event stream. Consumers (a UI, a recorder) subscribe via
//! `broadcast::Receiver`; a lagged receiver misses events rather than
//! blocking the engine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::SessionPhase;
use crate::summary::SessionSummary;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum EngineEvent {
    SessionStateChanged {
        phase: SessionPhase,
        session_id: Option<String>,
    },
    HitRegistered {
        device_id: String,
        device_name: String,
        hit_count: u32,
        timestamp: DateTime<Utc>,
    },
    TargetGoalReached {
        device_id: String,
        hit_count: u32,
    },
    SessionCompleted {
        session_id: String,
        summary: Box<SessionSummary>,
    },
    /// The push channel dropped; polling is now the sole telemetry source.
    ChannelDegraded {
        reason: String,
    },
}
