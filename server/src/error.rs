use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use thiserror::Error;

/// Which location rule refused a paint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Geofence,
    Radius,
    Speed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Geofence => write!(f, "geofence"),
            RejectReason::Radius => write!(f, "radius"),
            RejectReason::Speed => write!(f, "speed"),
        }
    }
}

/// Everything a request handler can refuse with. Admission failures are
/// terminal and surfaced to the client; store failures are surfaced
/// without retry.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadInput(String),
    #[error("turnstile")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(RejectReason),
    #[error("cooldown")]
    TooMany { retry_after_s: u64 },
    #[error("store: {0}")]
    StoreUnavailable(String),
    #[error("internal")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::TooMany { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::StoreUnavailable(_) | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            // 5xx detail stays in the logs, not the response.
            ApiError::StoreUnavailable(detail) => {
                tracing::error!("state store unavailable: {detail}");
                "store".to_string()
            }
            ApiError::Internal => "internal".to_string(),
            other => other.to_string(),
        };
        let retry_after = match &self {
            ApiError::TooMany { retry_after_s } => Some(*retry_after_s),
            _ => None,
        };

        let mut response = (self.status(), body).into_response();
        if let Some(seconds) = retry_after {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(seconds),
            );
        }
        response
    }
}
