//! Client and admin authentication.
//!
//! Both surfaces accept a Bearer token in the `Authorization` header or an
//! `x-api-key` header. Keys are compared in constant time: both sides are
//! hashed with SHA-256 and the digests are compared, so the comparison
//! cost never depends on how many prefix bytes match.

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Extract the presented API key from the request headers.
pub(crate) fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(authorization) = headers.get("authorization")
        && let Ok(value) = authorization.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && !token.is_empty()
    {
        return Some(token);
    }

    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// Constant-time equality of a presented key against the configured one.
pub(crate) fn keys_match(presented: &str, expected: &SecretString) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.expose_secret().as_bytes());

    presented == expected
}

/// Whether the request is authorized against the given key. `None`
/// (no key configured) authorizes everything on the client surface.
pub(crate) fn client_authorized(headers: &HeaderMap, expected: Option<&SecretString>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    presented_key(headers).is_some_and(|presented| keys_match(presented, expected))
}

/// Whether the request is authorized for the admin surface. Admin routes
/// reject every request when no admin key is configured.
pub(crate) fn admin_authorized(headers: &HeaderMap, expected: Option<&SecretString>) -> bool {
    let Some(expected) = expected else {
        return false;
    };

    presented_key(headers).is_some_and(|presented| keys_match(presented, expected))
}
