//! Bearer token gate
//!
//! Every protected route runs through [`require_bearer`] before its handler.
//! Rejection reasons are for logs only; callers always see a plain 401.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::warn;

use super::dto::ErrorResponse;
use super::rest::AppState;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("No authorization header")]
    Missing,

    #[error("Invalid authorization header format")]
    Malformed,

    #[error("Invalid authorization scheme")]
    Scheme,

    #[error("Invalid token")]
    Invalid,
}

/// Decides whether a request may proceed
pub trait AuthGate: Send + Sync {
    fn authorize(&self, header_value: Option<&str>) -> Result<(), AuthRejection>;
}

/// Single shared bearer secret
pub struct BearerGate {
    secret: String,
}

impl BearerGate {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AuthGate for BearerGate {
    fn authorize(&self, header_value: Option<&str>) -> Result<(), AuthRejection> {
        authorize(header_value, &self.secret)
    }
}

/// Validate an `Authorization` header value against `secret`
pub fn authorize(header_value: Option<&str>, secret: &str) -> Result<(), AuthRejection> {
    let value = header_value.ok_or(AuthRejection::Missing)?;

    let mut parts = value.split_whitespace();
    let (scheme, token) = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) => (scheme, token),
        _ => return Err(AuthRejection::Malformed),
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthRejection::Scheme);
    }

    if !constant_time_eq(token.as_bytes(), secret.as_bytes()) {
        return Err(AuthRejection::Invalid);
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware: short-circuit with 401 unless the gate authorizes the request
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default());

    if let Err(rejection) = state.auth.authorize(header_value) {
        warn!(reason = ?rejection, "Rejected {} {}", request.method(), request.uri().path());
        return (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(&rejection.to_string()))).into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token() {
        assert_eq!(authorize(Some("Bearer secret"), "secret"), Ok(()));
        assert_eq!(authorize(Some("bearer secret"), "secret"), Ok(()));
        assert_eq!(authorize(Some("BEARER   secret"), "secret"), Ok(()));
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(authorize(None, "secret"), Err(AuthRejection::Missing));
    }

    #[test]
    fn test_malformed_header() {
        assert_eq!(authorize(Some(""), "secret"), Err(AuthRejection::Malformed));
        assert_eq!(authorize(Some("secret"), "secret"), Err(AuthRejection::Malformed));
        assert_eq!(authorize(Some("Bearer secret extra"), "secret"), Err(AuthRejection::Malformed));
    }

    #[test]
    fn test_wrong_scheme() {
        assert_eq!(authorize(Some("Basic secret"), "secret"), Err(AuthRejection::Scheme));
        assert_eq!(authorize(Some("Token secret"), "secret"), Err(AuthRejection::Scheme));
    }

    #[test]
    fn test_wrong_token() {
        assert_eq!(authorize(Some("Bearer wrong"), "secret"), Err(AuthRejection::Invalid));
        assert_eq!(authorize(Some("Bearer Secret"), "secret"), Err(AuthRejection::Invalid));
        assert_eq!(authorize(Some("Bearer secret2"), "secret"), Err(AuthRejection::Invalid));
    }

    #[test]
    fn test_gate_uses_configured_secret() {
        let gate = BearerGate::new("s3cret");
        assert!(gate.authorize(Some("Bearer s3cret")).is_ok());
        assert!(gate.authorize(Some("Bearer secret")).is_err());
    }
}
