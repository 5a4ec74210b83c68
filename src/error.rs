//! Error types for Gaggle
//!
//! Every failure in the application is converted to `AppError`, which
//! implements `IntoResponse` so handlers can return it directly.
//!
//! The taxonomy:
//! - rejections (semantically refused activities) are logged, never retried;
//! - transport failures feed the delivery retry machinery;
//! - forgeries (bad signature, digest, date, origin) map to 401;
//! - corruption (JSON that is not an activity) maps to 400;
//! - capacity overruns map to 413;
//! - fatal store failures abort startup.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::federation::signature::SignatureError;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Request addressed to the wrong local user (403)
    #[error("Wrong user")]
    WrongUser,

    /// Signature verification failed (401)
    #[error("Signature rejected: {0}")]
    BadSignature(#[from] SignatureError),

    /// Activity semantically refused; no state change, no retry
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Payload parses as JSON but not as an activity (400)
    #[error("Malformed payload: {0}")]
    Corrupt(String),

    /// Wrong Content-Type on a federation endpoint (406)
    #[error("Unacceptable content type")]
    WrongContentType,

    /// Payload or media exceeds a configured ceiling (413)
    #[error("Too large: {0}")]
    Capacity(String),

    /// Network or HTTP-level failure talking to a peer (502)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// User-visible failures become status codes: 400 malformed,
    /// 401 signature, 403 wrong user, 404 unknown, 406 wrong content
    /// type, 413 too large, 500 internal. Internal detail is logged,
    /// not leaked.
    fn into_response(self) -> Response {
        let (status, message, error_type, log_detail) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found", false),
            AppError::WrongUser => (StatusCode::FORBIDDEN, self.to_string(), "wrong_user", false),
            AppError::BadSignature(_) => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "bad_signature",
                false,
            ),
            AppError::Rejected(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "rejected", false),
            AppError::Corrupt(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "corrupt", false),
            AppError::WrongContentType => (
                StatusCode::NOT_ACCEPTABLE,
                self.to_string(),
                "content_type",
                false,
            ),
            AppError::Capacity(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                msg.clone(),
                "capacity",
                false,
            ),
            AppError::Transport(_) => (
                StatusCode::BAD_GATEWAY,
                "Federation transport error".to_string(),
                "transport",
                true,
            ),
            AppError::HttpClient(_) => (
                StatusCode::BAD_GATEWAY,
                "Upstream HTTP error".to_string(),
                "http_client",
                true,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
                true,
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                "config",
                true,
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
                true,
            ),
        };

        if log_detail {
            tracing::error!(error = %self, %error_type, "Request failed with internal details");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[error_type])
            .inc();

        let body = axum::Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn transport_errors_are_sanitized() {
        let response =
            AppError::Transport("connect to secret-host refused".to_string()).into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_GATEWAY);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body_text = String::from_utf8(body.to_vec()).expect("utf8 body");
        assert!(body_text.contains("Federation transport error"));
        assert!(!body_text.contains("secret-host"));
    }

    #[tokio::test]
    async fn corrupt_errors_keep_message() {
        let response = AppError::Corrupt("missing id".to_string()).into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body_text = String::from_utf8(body.to_vec()).expect("utf8 body");
        assert!(body_text.contains("missing id"));
    }
}
