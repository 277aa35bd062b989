use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// In-memory lifecycle phase. `Starting` and `Stopping` collapse back to
/// `Idle` and `Running` respectively when a command batch fails outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Starting,
    Running,
    Stopping,
    Ended,
}

impl Default for SessionPhase {
    fn default() -> Self {
        SessionPhase::Idle
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub game_name: Option<String>,
    /// The successful subset from the start batch; stop defaults to this.
    pub target_device_ids: Vec<String>,
    pub goal_shots_per_target: HashMap<String, u32>,
    /// Devices whose goal has been reached. Grows monotonically within a
    /// session; cleared only when the next session begins.
    pub stopped_devices: HashSet<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u32>,
    /// Opaque passthrough context (room, preset, desired duration); carried
    /// into the summary unchanged.
    pub context: Value,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            session_id: None,
            game_name: None,
            target_device_ids: Vec::new(),
            goal_shots_per_target: HashMap::new(),
            stopped_devices: HashSet::new(),
            started_at: None,
            stopped_at: None,
            duration_secs: None,
            context: Value::Null,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new session may begin from `Idle` or from a previous `Ended`.
    pub fn is_startable(&self) -> bool {
        matches!(self.phase, SessionPhase::Idle | SessionPhase::Ended)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn begin_session(
        &mut self,
        session_id: String,
        game_name: Option<String>,
        target_device_ids: Vec<String>,
        goal_shots_per_target: HashMap<String, u32>,
        duration_secs: Option<u32>,
        started_at: DateTime<Utc>,
        context: Value,
    ) {
        *self = Self {
            phase: SessionPhase::Running,
            session_id: Some(session_id),
            game_name,
            target_device_ids,
            goal_shots_per_target,
            stopped_devices: HashSet::new(),
            started_at: Some(started_at),
            stopped_at: None,
            duration_secs,
            context,
        };
    }

    /// Drop session identity after the summary has been built. The phase
    /// stays `Ended` so callers can tell a finished session from a fresh
    /// engine.
    pub fn clear_bookkeeping(&mut self) {
        self.session_id = None;
        self.game_name = None;
        self.target_device_ids.clear();
        self.goal_shots_per_target.clear();
        self.stopped_devices.clear();
        self.duration_secs = None;
        self.context = Value::Null;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_startable() {
        let state = SessionState::new();
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.is_startable());
    }

    #[test]
    fn begin_session_resets_stopped_devices() {
        let mut state = SessionState::new();
        state.stopped_devices.insert("d1".to_string());

        state.begin_session(
            "s1".to_string(),
            Some("Bill Drill".to_string()),
            vec!["d1".to_string()],
            HashMap::new(),
            None,
            Utc::now(),
            Value::Null,
        );

        assert_eq!(state.phase, SessionPhase::Running);
        assert!(state.stopped_devices.is_empty());
        assert!(!state.is_startable());
    }

    #[test]
    fn ended_sessions_are_startable_after_bookkeeping_clears() {
        let mut state = SessionState::new();
        state.begin_session(
            "s1".to_string(),
            None,
            vec!["d1".to_string()],
            HashMap::new(),
            None,
            Utc::now(),
            Value::Null,
        );
        state.phase = SessionPhase::Ended;
        state.clear_bookkeeping();

        assert!(state.is_startable());
        assert!(state.session_id.is_none());
        assert!(state.target_device_ids.is_empty());
    }
}
