// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use axum::http::HeaderValue;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_str(value).unwrap());
    headers
}

#[test]
fn bearer_passes_when_auth_disabled() {
    assert!(validate_bearer(&HeaderMap::new(), None).is_ok());
}

#[test]
fn bearer_matches_token() {
    assert!(validate_bearer(&headers_with("Bearer secret"), Some("secret")).is_ok());
}

#[test]
fn bearer_rejects_wrong_or_missing_token() {
    assert!(validate_bearer(&headers_with("Bearer nope"), Some("secret")).is_err());
    assert!(validate_bearer(&headers_with("secret"), Some("secret")).is_err());
    assert!(validate_bearer(&HeaderMap::new(), Some("secret")).is_err());
}

#[test]
fn ws_token_passes_when_auth_disabled() {
    assert!(validate_ws_token(None, None).is_ok());
    assert!(validate_ws_token(Some("anything"), None).is_ok());
}

#[test]
fn ws_token_requires_exact_match() {
    assert!(validate_ws_token(Some("secret"), Some("secret")).is_ok());
    assert!(validate_ws_token(Some("nope"), Some("secret")).is_err());
    assert!(validate_ws_token(None, Some("secret")).is_err());
}

#[test]
fn ws_token_rejects_length_prefix() {
    assert!(validate_ws_token(Some("secre"), Some("secret")).is_err());
    assert!(validate_ws_token(Some("secrets"), Some("secret")).is_err());
}
