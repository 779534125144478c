use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize, Debug)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// API error taxonomy. Every handler failure funnels into one of these
/// variants, which render as `{"error":{"code","message","details?"}}` with
/// the mapped HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Validation { code: &'static str, message: String },
    Unauthorized { code: &'static str, message: String },
    Forbidden { code: &'static str, message: String },
    NotFound { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    PayloadTooLarge { message: String },
    RateLimited { retry_after_secs: u64, limit_type: Option<&'static str> },
    Upstream { message: String },
    Internal { message: Option<String> },
}

impl ApiError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { code, message: message.into() }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized { code, message: message.into() }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden { code, message: message.into() }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound { code, message: message.into() }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict { code, message: message.into() }
    }

    pub fn rate_limited(retry_after_secs: u64, limit_type: Option<&'static str>) -> Self {
        Self::RateLimited { retry_after_secs, limit_type }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream { message: message.into() }
    }

    /// Internal error carrying the source for logs; the envelope message is
    /// generic so internals never leak to clients.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal { message: Some(err.to_string()) }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { code, .. }
            | ApiError::Unauthorized { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::NotFound { code, .. }
            | ApiError::Conflict { code, .. } => code,
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Upstream { .. } => "upstream_error",
            ApiError::Internal { .. } => "internal_error",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.status())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, details, retry_after) = match self {
            ApiError::Validation { message, .. }
            | ApiError::Unauthorized { message, .. }
            | ApiError::Forbidden { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::PayloadTooLarge { message }
            | ApiError::Upstream { message } => (message, None, None),
            ApiError::RateLimited { retry_after_secs, limit_type } => (
                "Rate limit exceeded".to_string(),
                limit_type.map(|lt| serde_json::json!({ "limit_type": lt })),
                Some(retry_after_secs),
            ),
            // The original cause stays in the server logs only.
            ApiError::Internal { .. } => ("Internal server error".to_string(), None, None),
        };

        let envelope = ErrorEnvelope {
            error: ErrorBody { code: code.to_string(), message, details },
        };
        let mut resp = (status, Json(envelope)).into_response();
        if let Ok(value) = HeaderValue::from_str(code) {
            resp.headers_mut().insert("X-Error-Code", value);
        }
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
