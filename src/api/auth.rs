//! Shared-credential guard for mutating endpoints.
//!
//! When `API_CREDENTIAL` is configured, every mutating request must carry a
//! matching `x-api-key` header. Read-only endpoints and the event stream
//! stay open.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

pub const CREDENTIAL_HEADER: &str = "x-api-key";

fn is_mutating(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

pub async fn require_credential(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state
        .config
        .api_credential
        .as_ref()
        .filter(|_| is_mutating(req.method()))
    {
        let provided = req
            .headers()
            .get(CREDENTIAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(provided, expected) {
            return (
                StatusCode::UNAUTHORIZED,
                "missing or invalid credential".to_string(),
            )
                .into_response();
        }
    }
    next.run(req).await
}
