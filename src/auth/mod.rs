//! Authentication module
//!
//! Bearer-token verification: key resolution from a JWKS endpoint, signature
//! and claim checks, and the validated claim set handed to the rest of the
//! request pipeline.

use thiserror::Error;

pub mod claims;
pub mod jwks;
pub mod verifier;

pub use claims::{Audience, TokenClaims, ValidatedClaims};
pub use jwks::{HttpKeySetSource, KeyResolver, KeySetSource, ResolverOptions, StaticKeySetSource};
pub use verifier::TokenVerifier;

/// Authentication errors
///
/// Every rejection is terminal for the request. The variant is logged
/// server-side; clients only ever see a generic message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Invalid signature")]
    BadSignature,

    #[error("Issuer mismatch")]
    IssuerMismatch,

    #[error("Audience mismatch")]
    AudienceMismatch,

    #[error("Token expired or not yet valid")]
    Expired,

    #[error("Insufficient permission: missing {0:?}")]
    InsufficientPermission(Vec<String>),

    #[error("Key set fetch error: {0}")]
    KeyFetchFailure(String),
}

impl AuthError {
    /// Stable label for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingAuth => "missing_auth",
            AuthError::Malformed(_) => "malformed",
            AuthError::UnknownKey(_) => "unknown_key",
            AuthError::BadSignature => "bad_signature",
            AuthError::IssuerMismatch => "issuer_mismatch",
            AuthError::AudienceMismatch => "audience_mismatch",
            AuthError::Expired => "expired",
            AuthError::InsufficientPermission(_) => "insufficient_permission",
            AuthError::KeyFetchFailure(_) => "key_fetch_failure",
        }
    }

    /// HTTP status this rejection maps to
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InsufficientPermission(_) => 403,
            _ => 401,
        }
    }
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme is matched case-insensitively; anything other than a single
/// non-empty bearer credential is `MissingAuth`.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingAuth)?.trim();
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingAuth)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingAuth);
    }

    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return Err(AuthError::MissingAuth);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extracted() {
        assert_eq!(bearer_token(Some("Bearer abc.def.ghi")), Ok("abc.def.ghi"));
        assert_eq!(bearer_token(Some("bearer abc")), Ok("abc"));
    }

    #[test]
    fn test_bearer_token_rejects_other_shapes() {
        assert_eq!(bearer_token(None), Err(AuthError::MissingAuth));
        assert_eq!(bearer_token(Some("")), Err(AuthError::MissingAuth));
        assert_eq!(bearer_token(Some("Bearer")), Err(AuthError::MissingAuth));
        assert_eq!(bearer_token(Some("Bearer   ")), Err(AuthError::MissingAuth));
        assert_eq!(bearer_token(Some("Basic dXNlcjpwYXNz")), Err(AuthError::MissingAuth));
        assert_eq!(bearer_token(Some("Bearer a b")), Err(AuthError::MissingAuth));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::Expired.status_code(), 401);
        assert_eq!(AuthError::UnknownKey("k".into()).status_code(), 401);
        assert_eq!(
            AuthError::InsufficientPermission(vec!["write:posts".into()]).status_code(),
            403
        );
    }
}
