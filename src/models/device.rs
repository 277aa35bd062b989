use serde::{Deserialize, Serialize};

/// Connectivity tier reported by the target hardware. `Standby` targets are
/// reachable but idle; only `Offline` targets are excluded from telemetry
/// scans.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    Online,
    Standby,
    Offline,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Offline
    }
}

/// A physical sensor target. Identity is assigned by the backing platform;
/// the engine only ever references devices by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            status,
        }
    }

    /// Whether the device participates in telemetry scans.
    pub fn is_reachable(&self) -> bool {
        self.status != DeviceStatus::Offline
    }
}
