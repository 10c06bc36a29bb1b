use axum::{http::StatusCode, response::IntoResponse};
use serde_json::{json, Value};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy.
///
/// Each variant maps to an externally visible GraphQL error code and an HTTP
/// status. Authentication failures (`MissingCredential`, `InvalidCredential`,
/// `PredicateFailure`) and authorization denials (`Forbidden`) are distinct on
/// purpose: they surface as `UNAUTHENTICATED` vs `FORBIDDEN` to the caller.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Authentication =====
    #[error("authentication required")]
    MissingCredential,

    #[error("invalid or expired credential: {0}")]
    InvalidCredential(String),

    /// A policy leaf predicate failed while inspecting identity claims.
    /// Distinct from a plain denial: this is an authentication-class fault.
    #[error("policy predicate failure on {field}: {reason}")]
    PredicateFailure { field: String, reason: String },

    // ===== Authorization =====
    #[error("access denied for field {field}: {reason}")]
    Forbidden { field: String, reason: String },

    // ===== Rate limiting =====
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    // ===== Query validation =====
    #[error("invalid operation: {0}")]
    Validation(String),

    // ===== Upstream =====
    #[error("subgraph {service} unavailable: {reason}")]
    Upstream { service: String, reason: String },

    #[error("subgraph {service} timed out")]
    UpstreamTimeout { service: String },

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status for responses produced outside a GraphQL body
    /// (rate-limit rejections, malformed requests, transport faults).
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredential
            | GatewayError::InvalidCredential(_)
            | GatewayError::PredicateFailure { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { .. } | GatewayError::UpstreamTimeout { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Internal(_) | GatewayError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// GraphQL `extensions.code` value for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential
            | GatewayError::InvalidCredential(_)
            | GatewayError::PredicateFailure { .. } => "UNAUTHENTICATED",
            GatewayError::Forbidden { .. } => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Validation(_) => "GRAPHQL_VALIDATION_FAILED",
            GatewayError::Upstream { .. } | GatewayError::UpstreamTimeout { .. } => {
                "UPSTREAM_UNAVAILABLE"
            }
            GatewayError::Internal(_) | GatewayError::Unknown(_) => "INTERNAL",
        }
    }

    /// User-facing message. Internal detail is never exposed here; callers in
    /// development mode may choose `to_string()` instead.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::MissingCredential => "Authentication required".to_string(),
            GatewayError::InvalidCredential(_) => "Invalid or expired credential".to_string(),
            GatewayError::PredicateFailure { field, .. } => {
                format!("Authentication failure evaluating access to {}", field)
            }
            GatewayError::Forbidden { field, .. } => format!("Access denied for {}", field),
            GatewayError::RateLimited { retry_after } => {
                format!("Too many requests, retry after {}s", retry_after)
            }
            GatewayError::Validation(msg) => msg.clone(),
            GatewayError::Upstream { service, .. } => format!("Service {} unavailable", service),
            GatewayError::UpstreamTimeout { service } => {
                format!("Service {} timed out", service)
            }
            GatewayError::Internal(_) | GatewayError::Unknown(_) => {
                "Internal server error".to_string()
            }
        }
    }

    /// Render as a GraphQL error object: `{message, extensions: {code, correlationId}}`.
    pub fn to_graphql_error(&self, correlation_id: &str, expose_detail: bool) -> Value {
        let message = if expose_detail {
            self.to_string()
        } else {
            self.user_message()
        };
        json!({
            "message": message,
            "extensions": {
                "code": self.error_code(),
                "correlationId": correlation_id,
            }
        })
    }

    /// Log with a level appropriate to the class of failure.
    pub fn log(&self, correlation_id: &str) {
        let code = self.error_code();
        match self {
            GatewayError::Internal(_) | GatewayError::Unknown(_) => {
                tracing::error!(
                    error = %self,
                    error_code = %code,
                    correlation_id = %correlation_id,
                    "Internal gateway error"
                );
            }
            GatewayError::Upstream { .. } | GatewayError::UpstreamTimeout { .. } => {
                tracing::warn!(
                    error = %self,
                    error_code = %code,
                    correlation_id = %correlation_id,
                    "Upstream failure"
                );
            }
            _ => {
                tracing::debug!(
                    error = %self,
                    error_code = %code,
                    correlation_id = %correlation_id,
                    "Request rejected"
                );
            }
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            GatewayError::UpstreamTimeout { service }
        } else {
            GatewayError::Upstream {
                service,
                reason: err.to_string(),
            }
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Internal(format!("counter store error: {}", err))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        // Rate-limit rejections use the documented 429 body shape instead of
        // the GraphQL errors array.
        if let GatewayError::RateLimited { retry_after } = &self {
            let body = json!({
                "error": "Too many requests",
                "retryAfter": retry_after,
            });
            return (status, axum::Json(body)).into_response();
        }

        let body = json!({
            "error": self.user_message(),
            "code": self.error_code(),
            "status": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
