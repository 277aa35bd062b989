pub mod device;
pub mod event;
pub mod records;
pub mod session;

pub use device::{Device, DeviceStatus};
pub use event::{EventKind, NormalizedEvent, TelemetryFrame};
pub use records::{HitRecord, SplitRecord, TransitionRecord};
pub use session::{SessionRecord, SessionStatus};
