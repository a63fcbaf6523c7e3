//! Error taxonomy shared by every component and its HTTP rendering.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::runtime::RuntimeError;

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Failure categories surfaced by the service.
///
/// A command that ran and exited nonzero is not an error; it is returned as
/// an [`crate::gateway::ExecResult`] carrying the exit code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Unknown session, or a session that has already been destroyed.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed request payload.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Identifier already taken by another live session.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The execution runtime cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The session is live but nothing is accepting connections yet.
    #[error("upstream not ready: {0}")]
    UpstreamNotReady(String),
    /// Request body over the configured limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    /// The upstream answered with a broken response.
    #[error("bad gateway: {0}")]
    BadGateway(String),
    /// The upstream accepted the connection but did not answer in time.
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    /// Admission limiter rejected the request.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    /// Anything unexpected.
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) | Self::UpstreamNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::UpstreamNotReady(_) => "upstream_not_ready",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::BadGateway(_) => "bad_gateway",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable(msg) => Self::Unavailable(msg),
            RuntimeError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {err}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal(msg) = &self {
            error!(error = %msg, "request failed");
        }
        let status = self.status();
        let body = Json(json!({ "error": self.kind(), "message": self.to_string() }));
        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
