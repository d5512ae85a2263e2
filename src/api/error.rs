use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::QueueError;
use crate::scheduler::PoolError;

/// Error type for operator API handlers.
///
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The queue store rejected or could not take the request.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A worker pool operation failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Queue(err) => {
                tracing::error!(error = %err, "Queue store error");
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
            }
            ApiError::Pool(PoolError::OutOfBounds { .. }) => {
                (StatusCode::BAD_REQUEST, "OUT_OF_BOUNDS")
            }
            ApiError::Pool(PoolError::ResizeTimeout { .. }) => {
                tracing::warn!(error = %self, "Worker resize timed out");
                (StatusCode::GATEWAY_TIMEOUT, "RESIZE_TIMEOUT")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        };

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
