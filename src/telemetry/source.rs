//! Collaborator seams for the telemetry platform: pull fetch, push channel,
//! and device command batches. The engine never talks to hardware directly;
//! a host application implements these traits against its backend.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::TelemetryFrame;

/// Raw pull response: per device, per requested key, one shape-agnostic
/// payload (see `telemetry::normalizer` for the accepted shapes).
pub type RawTelemetry = HashMap<String, HashMap<String, Value>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceCommand {
    Start,
    Stop,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Start => write!(f, "start"),
            DeviceCommand::Stop => write!(f, "stop"),
        }
    }
}

/// Per-device outcome of a command batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub device_id: String,
    pub success: bool,
    pub warning: Option<String>,
}

/// Non-fatal per-device failure, reported back to the caller as data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandWarning {
    pub device_id: String,
    pub warning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBatchResponse {
    pub results: Vec<CommandResult>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl CommandBatchResponse {
    /// Device ids that acknowledged, in the order the batch targeted them.
    pub fn successes(&self, targeted: &[String]) -> Vec<String> {
        targeted
            .iter()
            .filter(|id| {
                self.results
                    .iter()
                    .any(|r| r.success && r.device_id == **id)
            })
            .cloned()
            .collect()
    }

    /// Per-device failures for the targeted set. A device absent from
    /// `results` counts as failed (an empty response is "all failed").
    pub fn warnings(&self, targeted: &[String]) -> Vec<CommandWarning> {
        targeted
            .iter()
            .filter_map(|id| {
                match self.results.iter().find(|r| r.device_id == **id) {
                    Some(result) if result.success => None,
                    Some(result) => Some(CommandWarning {
                        device_id: id.clone(),
                        warning: result
                            .warning
                            .clone()
                            .unwrap_or_else(|| "device rejected command".to_string()),
                    }),
                    None => Some(CommandWarning {
                        device_id: id.clone(),
                        warning: "device did not acknowledge".to_string(),
                    }),
                }
            })
            .collect()
    }
}

/// Handle to an open push channel. Dropping it (or calling `close`) cancels
/// the provider's delivery task; the provider must stop sending frames once
/// the token is cancelled.
#[derive(Debug)]
pub struct ChannelHandle {
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Live telemetry source: slow reliable pull plus fast lossy push.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Fetch the freshest payloads for `keys` across `device_ids`.
    async fn fetch(&self, device_ids: &[String], keys: &[String]) -> Result<RawTelemetry>;

    /// Open one push channel covering `device_ids`, delivering frames into
    /// `frames` until the returned handle is closed. Closing the `frames`
    /// sender without the handle being closed signals a channel error; the
    /// provider must not keep delivering after a failure.
    async fn subscribe(
        &self,
        device_ids: &[String],
        frames: mpsc::Sender<TelemetryFrame>,
    ) -> Result<ChannelHandle>;
}

/// Command path to the targets. Separate from `TelemetryProvider` so hosts
/// can route commands and telemetry through different services.
#[async_trait]
pub trait DeviceCommander: Send + Sync {
    async fn send_batch(
        &self,
        device_ids: &[String],
        command: DeviceCommand,
        params: Value,
    ) -> Result<CommandBatchResponse>;
}
