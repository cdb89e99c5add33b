use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_types::{ErrorBody, GatewayError};

/// Wraps `GatewayError` so this crate can implement `IntoResponse` on it
/// without running into the orphan rule (neither type is local to axum).
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = (&self.0).into();
        (status, Json(body)).into_response()
    }
}

pub fn error_response(err: GatewayError) -> Response {
    ApiError(err).into_response()
}
