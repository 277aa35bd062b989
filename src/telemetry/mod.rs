pub mod normalizer;
pub mod source;

pub use normalizer::{normalize, resolve_timestamp, resolve_value};
pub use source::{
    ChannelHandle, CommandBatchResponse, CommandResult, CommandWarning, DeviceCommand,
    DeviceCommander, RawTelemetry, TelemetryProvider,
};
