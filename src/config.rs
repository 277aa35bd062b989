use std::time::Duration;

/// Engine tuning knobs: polling cadence tiers, activity thresholds, and
/// collaborator timeouts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A hit newer than this keeps polling in `Active`.
    pub active_threshold: Duration,
    /// A hit older than this (and no newer one anywhere) drops polling to
    /// `Standby`.
    pub standby_threshold: Duration,

    /// Poll period while in `Active`.
    pub active_interval: Duration,
    /// Poll period while in `Recent`.
    pub recent_interval: Duration,
    /// Poll period while in `Standby`.
    pub standby_interval: Duration,

    /// Upper bound on one pull-telemetry request.
    pub fetch_timeout: Duration,
    /// Upper bound on one device command batch.
    pub command_timeout: Duration,

    /// Capacity of the normalized-event queue feeding the ingest task.
    pub event_buffer: usize,

    /// Telemetry keys requested from the pull endpoint and expected in push
    /// frames.
    pub telemetry_keys: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active_threshold: Duration::from_secs(30),
            standby_threshold: Duration::from_secs(600),
            active_interval: Duration::from_secs(5),
            recent_interval: Duration::from_secs(20),
            standby_interval: Duration::from_secs(45),
            fetch_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            event_buffer: 256,
            telemetry_keys: vec!["state".to_string()],
        }
    }
}
