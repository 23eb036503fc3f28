use crate::state::WakeState;

/// Protocol-level failure classes. Each one is recorded on the owning wake
/// cycle or chunk buffer; none of them stops processing for other devices.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// Steady state for devices not yet mapped to a site; degrades to sleep-only.
    #[error("device {mac} is not mapped to a site")]
    UnmappedDevice { mac: String },

    #[error("chunk {index} out of range for {image_name} ({total} chunks)")]
    ChunkOutOfRange {
        image_name: String,
        index: u32,
        total: u32,
    },

    #[error("integrity check failed for {image_name}: {reason}")]
    IntegrityCheckFailed { image_name: String, reason: String },

    #[error("transfer stale for {idle_secs}s")]
    StaleTransfer { idle_secs: i64 },

    #[error("schedule unresolvable: {0}")]
    ScheduleUnresolvable(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: WakeState, to: WakeState },

    #[error("device reported error code {0}")]
    DeviceReported(i64),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Short classification string for logs, metrics and anomaly rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnmappedDevice { .. } => "unmapped_device",
            Self::ChunkOutOfRange { .. } => "chunk_out_of_range",
            Self::IntegrityCheckFailed { .. } => "integrity_check_failed",
            Self::StaleTransfer { .. } => "stale_transfer",
            Self::ScheduleUnresolvable(_) => "schedule_unresolvable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::DeviceReported(_) => "device_reported",
            Self::Malformed(_) => "malformed",
        }
    }

    /// Whether the owning wake cycle becomes eligible for a queued retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IntegrityCheckFailed { .. } | Self::StaleTransfer { .. } | Self::DeviceReported(_)
        )
    }
}

/// Errors raised while parsing a wake schedule expression.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("empty schedule expression")]
    Empty,
    #[error("expected at least minute and hour fields in {0:?}")]
    MissingFields(String),
    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
    #[error("no wake time matches {0:?}")]
    NoMatch(String),
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

impl From<ScheduleError> for ProtocolError {
    fn from(e: ScheduleError) -> Self {
        ProtocolError::ScheduleUnresolvable(e.to_string())
    }
}

/// Errors raised while normalizing inbound firmware messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unrecognised topic {0:?}")]
    UnknownTopic(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}
