//! Error-to-HTTP mapping.
//!
//! One `ApiError` type carries the taxonomy kind plus a display-safe
//! message. Internal diagnostics are logged at the point of failure and
//! never serialized into a response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pylon_protocol::http_types::ErrorResponse;
use pylon_protocol::ErrorKind;
use pylon_pool::{ExecutorError, PoolError};
use pylon_store::StoreError;

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "authentication required")
    }

    pub fn internal() -> Self {
        Self::new(ErrorKind::InternalError, "internal error")
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SyntaxError
        | ErrorKind::NameError
        | ErrorKind::RuntimeError
        | ErrorKind::ResourceExceeded
        | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::SandboxViolation | ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::SignatureInvalid => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout | ErrorKind::WorkerUnavailable => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            kind: self.kind,
            message: self.message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        // Transport detail (pipe errors, desync ids) stays in the log.
        tracing::warn!("executor transport failure: {}", err);
        let message = match err.kind() {
            ErrorKind::Timeout => "worker did not answer in time".to_string(),
            _ => "worker unavailable; a replacement is starting".to_string(),
        };
        Self::new(err.kind(), message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let kind = err.kind();
        let message = match kind {
            // Never leak filesystem detail for internal store failures.
            ErrorKind::InternalError => {
                tracing::error!("script store failure: {}", err);
                "script store failure".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::SandboxViolation), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::PoolExhausted), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::SignatureInvalid), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
    }
}
