use thiserror::Error;

use crate::telemetry::source::DeviceCommand;

/// Caller-facing failures. Partial command failures are deliberately absent:
/// they travel back as `CommandWarning` data, never as errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no target devices were given")]
    EmptyDeviceSet,

    #[error("no session is running")]
    NoActiveSession,

    /// Every targeted device failed to acknowledge. Carries the operation
    /// and the device set so a retry can target the same batch.
    #[error("{operation} command failed for all targeted devices: {device_ids:?}")]
    CommandFailed {
        operation: DeviceCommand,
        device_ids: Vec<String>,
    },

    #[error("telemetry channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
