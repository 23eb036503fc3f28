use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use wakegate_core::errors::WireError;
use wakegate_core::ProtocolError;
use wakegate_engine::EngineError;
use wakegate_store::StoreError;

/// Failures surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid message: {0}")]
    Wire(#[from] WireError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Wire(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(e) => match e {
                EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                EngineError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
                EngineError::Protocol(ProtocolError::Malformed(_)) => StatusCode::BAD_REQUEST,
                EngineError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Wire(_) => "malformed",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Engine(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "request rejected");
        }
        let body = json!({ "error": { "kind": self.kind(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}
