pub mod scheduler;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::models::Device;

pub use scheduler::{PollContext, PollScheduler};

/// Refresh-rate tier. Never set directly; always recomputed from observed
/// hit activity via `compute_mode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PollingMode {
    Active,
    Recent,
    Standby,
}

impl PollingMode {
    pub(crate) fn priority(self) -> u8 {
        match self {
            PollingMode::Active => 2,
            PollingMode::Recent => 1,
            PollingMode::Standby => 0,
        }
    }
}

/// Derive the polling tier from time-since-last-hit across reachable
/// devices. A device that never hit, or whose recorded hit lies in the
/// future (clock skew), contributes `Standby`; offline devices are skipped
/// entirely.
pub fn compute_mode(
    now: DateTime<Utc>,
    devices: &[Device],
    last_hit_by_device: &HashMap<String, DateTime<Utc>>,
    config: &EngineConfig,
) -> PollingMode {
    let mut mode = PollingMode::Standby;

    for device in devices.iter().filter(|d| d.is_reachable()) {
        let last_hit = match last_hit_by_device.get(&device.id) {
            Some(ts) if *ts <= now => *ts,
            _ => continue,
        };

        let since = (now - last_hit).to_std().unwrap_or_default();
        if since < config.active_threshold {
            return PollingMode::Active;
        }
        if since < config.standby_threshold {
            mode = PollingMode::Recent;
        }
    }

    mode
}
