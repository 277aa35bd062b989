pub mod controller;
pub mod state;

pub use controller::{SessionController, StartOutcome, StartRequest, StopOutcome};
pub use state::{SessionPhase, SessionState};
