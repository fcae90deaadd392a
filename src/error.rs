use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error type covering every failure class a request can hit on its
/// way through the pipeline (auth -> rbac -> rate limit -> proxy).
///
/// Each pipeline stage owns its failure class and replies directly; the
/// backend never sees a request that produced one of these.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Authentication & Authorization =====
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("authorization failed: {0}")]
    Forbidden(String),

    // ===== Rate Limiting =====
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        /// Seconds until the governing window resets.
        retry_after_secs: u64,
    },

    // ===== Upstream (proxied) failures =====
    #[error("backend unreachable: {0}")]
    BadGateway(String),

    #[error("backend timed out: {0}")]
    GatewayTimeout(String),

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for programmatic handling by callers.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "UNAUTHENTICATED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::BadGateway(_) => "BAD_GATEWAY",
            GatewayError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// User-facing message, with internal detail stripped on 5xx.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Unauthenticated(msg) | GatewayError::Forbidden(msg) => msg.clone(),
            GatewayError::RateLimited { message, .. } => message.clone(),
            GatewayError::BadGateway(_) => "Backend service unavailable".to_string(),
            GatewayError::GatewayTimeout(_) => "Backend service timed out".to_string(),
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Log this error at the level its class warrants.
    pub fn log(&self) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(error = %self, error_code = %code, status = %status.as_u16(), "Request failed");
        } else if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(error = %self, error_code = %code, "Authentication failed");
        } else {
            tracing::debug!(error = %self, error_code = %code, "Request rejected");
        }
    }

    /// Wire body for this error.
    ///
    /// 401/403 use the legacy bare-string shape `{"success":false,"error":"…"}`
    /// the dashboard already parses; everything else uses the structured
    /// `{code, message}` envelope. See DESIGN.md for the compatibility note.
    pub fn body(&self) -> serde_json::Value {
        match self {
            GatewayError::Unauthenticated(_) | GatewayError::Forbidden(_) => json!({
                "success": false,
                "error": self.user_message(),
            }),
            GatewayError::RateLimited {
                message,
                retry_after_secs,
            } => json!({
                "success": false,
                "error": {
                    "code": self.error_code(),
                    "message": message,
                    "retryAfter": retry_after_secs,
                },
            }),
            _ => json!({
                "success": false,
                "error": {
                    "code": self.error_code(),
                    "message": self.user_message(),
                },
            }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        self.log();
        (self.status_code(), axum::Json(self.body())).into_response()
    }
}
