pub mod commands;
pub mod errors;
pub mod ids;
pub mod schedule;
pub mod state;
pub mod telemetry;
pub mod wire;

pub use errors::ProtocolError;
pub use schedule::{ScheduleSource, WakePlan, WakeResolution, WakeScheduler};
pub use state::{BufferStatus, RetryStatus, SessionStatus, WakeOutcome, WakeState};
