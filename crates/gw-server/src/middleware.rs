//! Admission pipeline stages 1-3 (identify, validate, rate-limit), run as a
//! single axum middleware ahead of every request-bearing route. Stage 4
//! (endpoint-specific permission check) and stage 5 (budget reservation)
//! need the parsed request body, so they run inline in each handler instead
//! — see `crate::routes`.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use gw_auth::RateLimitDecision;
use gw_types::GatewayError;

use crate::error::error_response;
use crate::state::AppState;

/// The identified caller, attached to request extensions for handlers to read.
#[derive(Debug, Clone)]
pub struct Identity {
    pub api_key: String,
    pub project_id: String,
}

pub async fn admission_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if path == "/health" || path == "/ready" {
        return next.run(request).await;
    }

    let Some(key) = extract_key(request.headers(), request.uri().query()) else {
        return error_response(GatewayError::AuthMissing);
    };

    let record = match state.auth.lookup(&key).await {
        Ok(Some(record)) if !record.is_revoked() => record,
        Ok(Some(_)) => return error_response(GatewayError::AuthRevoked),
        Ok(None) => return error_response(GatewayError::AuthInvalid),
        Err(_) => return error_response(GatewayError::Internal),
    };

    match state.auth.check_and_increment_rate_limit(&key).await {
        Ok(RateLimitDecision::Allowed) => {}
        Ok(RateLimitDecision::Exceeded { retry_after_s }) => {
            return error_response(GatewayError::RateLimited { retry_after_s })
        }
        Err(_) => return error_response(GatewayError::Internal),
    }

    if state.is_draining() {
        return error_response(GatewayError::overloaded_draining());
    }

    request.extensions_mut().insert(Identity {
        api_key: key,
        project_id: record.project_id,
    });
    next.run(request).await
}

/// `Authorization: Bearer <key>` takes precedence; `?api_key=<key>` is the
/// WebSocket-friendly fallback since browsers can't set headers on upgrades.
fn extract_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let trimmed = auth.trim();
        if let Some(bearer) = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer ")) {
            let token = bearer.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = query?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("api_key=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer cc_header"));
        assert_eq!(extract_key(&headers, Some("api_key=cc_query")), Some("cc_header".to_string()));
    }

    #[test]
    fn falls_back_to_query_param_when_no_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_key(&headers, Some("api_key=cc_query")), Some("cc_query".to_string()));
    }

    #[test]
    fn missing_both_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_key(&headers, None), None);
    }
}
