//! Request authentication for the webhook surface.
//!
//! Three independent mechanisms, one per caller class: a bearer token for
//! operator endpoints, a shared-secret header for the settlement callback,
//! and an HMAC body signature for the SMS gateway webhook. All comparisons
//! are constant-time; failures reject before any state is read.

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// State for the operator bearer-token middleware.
#[derive(Clone)]
pub struct AuthState {
    pub token: String,
}

/// Bearer-token middleware for operator routes.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token, &auth.token) => next.run(request).await,
        _ => {
            tracing::warn!("rejected operator request with missing or bad bearer token");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Constant-time string equality.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Hex-encoded HMAC-SHA256 of a webhook body under the shared gateway token.
///
/// The gateway signs the raw request body; we recompute and compare. Also used
/// by tests to build valid inbound requests.
pub fn sign_body(token: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Verify a presented signature against the raw body.
pub fn verify_signature(token: &str, body: &[u8], presented: &str) -> bool {
    constant_time_eq(&sign_body(token, body), presented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let body = br#"{"from":"+15555550100","body":"STOP"}"#;
        let signature = sign_body("gateway-token", body);
        assert!(verify_signature("gateway-token", body, &signature));
    }

    #[test]
    fn signature_rejects_tampering() {
        let body = br#"{"from":"+15555550100","body":"STOP"}"#;
        let signature = sign_body("gateway-token", body);

        assert!(!verify_signature("gateway-token", b"tampered", &signature));
        assert!(!verify_signature("other-token", body, &signature));
        assert!(!verify_signature("gateway-token", body, "deadbeef"));
    }
}
