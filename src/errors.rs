use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-wide error type
#[derive(Debug)]
pub enum AppError {
    // Configuration errors (fatal at startup)
    Configuration(String),

    // Key resolution errors (recovered by falling back to an IP key)
    KeyResolution(String),

    // Window store errors (recovered as a cache miss / fail-open)
    Store(String),

    // Quota exceeded: the only user-visible failure mode
    RateLimitExceeded { retry_after_seconds: u64 },

    // Internal errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::KeyResolution(msg) => write!(f, "Key resolution failed: {}", msg),
            AppError::Store(msg) => write!(f, "Window store error: {}", msg),
            AppError::RateLimitExceeded { .. } => write!(f, "Rate limit exceeded"),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

// Implement IntoResponse for Axum
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::RateLimitExceeded {
                retry_after_seconds,
            } => {
                let body = Json(json!({
                    "error": "Too Many Requests",
                    "message": "Rate limit exceeded. Please retry later.",
                    "retryAfter": retry_after_seconds,
                }));
                (StatusCode::TOO_MANY_REQUESTS, body).into_response()
            }
            _ => {
                tracing::error!("Internal error: {:?}", self);
                let body = Json(json!({
                    "error": "Internal server error",
                    "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                }));
                (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
            }
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_exceeded_maps_to_429() {
        let response = AppError::RateLimitExceeded {
            retry_after_seconds: 30,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_internal_errors_map_to_500() {
        let response = AppError::Store("boom".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
