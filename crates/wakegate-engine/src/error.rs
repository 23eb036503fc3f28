use wakegate_core::ProtocolError;
use wakegate_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("publish error: {0}")]
    Publish(String),

    /// The per-device worker is gone (shutdown, or its queue closed).
    #[error("worker unavailable for device {0}")]
    WorkerUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.kind(),
            Self::Store(_) => "store",
            Self::Blob(_) => "blob",
            Self::Publish(_) => "publish",
            Self::WorkerUnavailable(_) => "worker_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_kind_passes_through() {
        let err: EngineError = ProtocolError::StaleTransfer { idle_secs: 300 }.into();
        assert_eq!(err.kind(), "stale_transfer");
        assert_eq!(err.to_string(), "protocol error: transfer stale for 300s");
    }

    #[test]
    fn store_errors_convert() {
        let err: EngineError = StoreError::NotFound("device dev_1".into()).into();
        assert!(matches!(err, EngineError::Store(ref e) if e.is_not_found()));
        assert_eq!(err.kind(), "store");
    }
}
