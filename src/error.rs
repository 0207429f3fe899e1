use crate::lock::LockError;
use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by the streaming cache and the ingestion coordinator.
///
/// Store and lock failures are infrastructure errors: the caller decides
/// whether to retry. A production error is scoped to one resource id and the
/// partial log has already been removed, so the next attempt starts clean.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Log store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Resource {id} cannot be produced: {reason}")]
    Production { id: String, reason: String },

    #[error("Shutting down; no new productions are started")]
    ShuttingDown,
}

impl CacheError {
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, CacheError::Production { .. })
    }
}

/// HTTP-facing error type.
#[derive(Debug, Error)]
pub enum TailcastError {
    #[error("Invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, TailcastError>;

impl TailcastError {
    pub fn status(&self) -> StatusCode {
        match self {
            TailcastError::InvalidResourceId(_) => StatusCode::BAD_REQUEST,
            TailcastError::Cache(CacheError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            TailcastError::Cache(e) if e.is_infrastructure() => StatusCode::INTERNAL_SERVER_ERROR,
            TailcastError::Cache(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TailcastError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TailcastError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Infrastructure details stay in the log.
        let message = if status.is_server_error() {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            warn!("Request rejected: {}", self);
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
