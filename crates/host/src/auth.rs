// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ErrorCode;
use crate::run::App;

/// Constant-time string comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a Bearer token from HTTP headers.
///
/// Returns `Ok(())` when `expected` is `None` (auth disabled) or when the
/// header matches.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    let expected = match expected {
        Some(token) => token,
        None => return Ok(()),
    };

    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ErrorCode::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ErrorCode::Unauthorized)?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ErrorCode::Unauthorized)
    }
}

/// Validate the `?token=` query value on a WebSocket upgrade.
pub fn validate_ws_token(token: Option<&str>, expected: Option<&str>) -> Result<(), ErrorCode> {
    match (expected, token) {
        (None, _) => Ok(()),
        (Some(expected), Some(token)) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(ErrorCode::Unauthorized),
    }
}

/// Axum middleware enforcing Bearer auth on all routes except the health
/// endpoint and WebSocket upgrades (which authenticate via query param).
pub async fn auth_layer(
    State(app): State<Arc<App>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/api/v1/health" || path == "/ws" {
        return next.run(req).await;
    }

    if let Err(code) = validate_bearer(req.headers(), app.auth_token.as_deref()) {
        let body = serde_json::json!({
            "error": { "code": code.as_str(), "message": "unauthorized" },
        });
        return (
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            axum::Json(body),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
