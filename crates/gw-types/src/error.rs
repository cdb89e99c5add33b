use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The taxonomy every admission/pool/executor failure collapses into before
/// it reaches an HTTP response or a WebSocket `error` frame.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("missing API key")]
    AuthMissing,
    #[error("invalid API key")]
    AuthInvalid,
    #[error("API key revoked")]
    AuthRevoked,
    #[error("permission denied for {field}")]
    PermissionDenied { field: String },
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },
    #[error("monthly budget exceeded")]
    BudgetExceeded,
    #[error("per-task cost cap exceeded")]
    CostExceeded,
    #[error("request timed out")]
    Timeout,
    #[error("service overloaded: {reason}")]
    Overloaded { reason: String },
    #[error("invalid request field {field}")]
    InvalidRequest { field: String },
    #[error("child process produced malformed output")]
    OutputMalformed,
    #[error("child process exited with code {code}")]
    ChildExit { code: i32 },
    #[error("upstream provider error: {message}")]
    UpstreamError { message: String },
    #[error("internal error")]
    Internal,
}

impl GatewayError {
    /// HTTP status this error kind maps to, per the taxonomy's propagation policy.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid | GatewayError::AuthRevoked => {
                401
            }
            GatewayError::PermissionDenied { .. } => 403,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::BudgetExceeded => 429,
            GatewayError::CostExceeded => 402,
            GatewayError::Timeout => 408,
            GatewayError::Overloaded { .. } => 503,
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::OutputMalformed
            | GatewayError::ChildExit { .. }
            | GatewayError::UpstreamError { .. } => 502,
            GatewayError::Internal => 500,
        }
    }

    pub fn overloaded_draining() -> Self {
        GatewayError::Overloaded {
            reason: "service draining".to_string(),
        }
    }
}

/// Wire shape for an error frame/body: `{type, message, retry_after_s?, field?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        let (retry_after_s, field) = match err {
            GatewayError::RateLimited { retry_after_s } => (Some(*retry_after_s), None),
            GatewayError::PermissionDenied { field } => (None, Some(field.clone())),
            GatewayError::InvalidRequest { field } => (None, Some(field.clone())),
            _ => (None, None),
        };
        ErrorBody {
            kind: error_kind_tag(err).to_string(),
            message: err.to_string(),
            retry_after_s,
            field,
        }
    }
}

fn error_kind_tag(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::AuthMissing => "auth_missing",
        GatewayError::AuthInvalid => "auth_invalid",
        GatewayError::AuthRevoked => "auth_revoked",
        GatewayError::PermissionDenied { .. } => "permission_denied",
        GatewayError::RateLimited { .. } => "rate_limited",
        GatewayError::BudgetExceeded => "budget_exceeded",
        GatewayError::CostExceeded => "cost_exceeded",
        GatewayError::Timeout => "timeout",
        GatewayError::Overloaded { .. } => "overloaded",
        GatewayError::InvalidRequest { .. } => "invalid_request",
        GatewayError::OutputMalformed => "output_malformed",
        GatewayError::ChildExit { .. } => "child_exit",
        GatewayError::UpstreamError { .. } => "upstream_error",
        GatewayError::Internal => "internal",
    }
}
