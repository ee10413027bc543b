//! Bearer token verification
//!
//! Runs the checks in a fixed order and stops at the first failure:
//!
//! 1. structure (`Malformed`)
//! 2. key lookup by `kid` (`UnknownKey`)
//! 3. signature (`BadSignature`)
//! 4. issuer (`IssuerMismatch`)
//! 5. audience (`AudienceMismatch`)
//! 6. validity window (`Expired`)
//!
//! The payload must decode to a JSON object before any key is looked up.
//! `jsonwebtoken` is only asked to check the signature; the claim checks are
//! done here so the order above holds.
//!
//! # Example
//!
//! ```no_run
//! use komainu::auth::{KeyResolver, ResolverOptions, StaticKeySetSource, TokenVerifier};
//! use std::sync::Arc;
//!
//! # async fn example(raw_token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let source = StaticKeySetSource::from_json(r#"{"keys": []}"#)?;
//! let resolver = Arc::new(KeyResolver::new(Arc::new(source), ResolverOptions::default()));
//! let verifier = TokenVerifier::new(resolver, "https://auth.example.com/", "https://api.example.com");
//!
//! let claims = verifier.verify(raw_token).await?;
//! println!("subject: {}", claims.subject());
//! # Ok(())
//! # }
//! ```

use super::claims::{TokenClaims, ValidatedClaims};
use super::jwks::KeyResolver;
use super::AuthError;
use crate::metrics;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{crypto, decode_header, Algorithm};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Validates bearer tokens against the provider's key set
pub struct TokenVerifier {
    resolver: Arc<KeyResolver>,
    issuer: String,
    audience: String,
    algorithms: Vec<Algorithm>,
    leeway: u64,
}

impl TokenVerifier {
    /// Create a verifier for one issuer/audience pair, accepting RS256 only
    pub fn new(resolver: Arc<KeyResolver>, issuer: &str, audience: &str) -> Self {
        Self {
            resolver,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            algorithms: vec![Algorithm::RS256],
            leeway: 0,
        }
    }

    /// Set the accepted signing algorithms
    #[must_use]
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Allow this many seconds of clock skew on `exp` and `nbf`
    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.leeway = seconds;
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    /// Verify against the configured issuer and audience
    pub async fn verify(&self, raw: &str) -> Result<ValidatedClaims, AuthError> {
        self.verify_for(raw, &self.audience, &self.issuer).await
    }

    /// Verify against an explicit audience and issuer
    pub async fn verify_for(
        &self,
        raw: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<ValidatedClaims, AuthError> {
        let started = Instant::now();
        let result = self.run_checks(raw, expected_audience, expected_issuer).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(claims) => {
                debug!(subject = %claims.subject(), "Token verified");
                metrics::record_verification("ok", elapsed);
            }
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "Token rejected");
                metrics::record_verification(e.reason(), elapsed);
            }
        }

        result
    }

    async fn run_checks(
        &self,
        raw: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<ValidatedClaims, AuthError> {
        // 1. Structure
        let segments: Vec<&str> = raw.split('.').collect();
        let [header_part, payload_part, signature] = segments.as_slice() else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(AuthError::Malformed("empty segment".into()));
        }
        let header = decode_header(raw)
            .map_err(|e| AuthError::Malformed(format!("invalid header: {}", e)))?;
        let payload = decode_payload(payload_part)?;
        URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(format!("invalid signature encoding: {}", e)))?;

        // 2. Key lookup
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::UnknownKey("<none>".into()))?;
        let key = match self.resolver.resolve(kid).await {
            Some(key) => key,
            // Fail closed: no key set was ever obtained
            None if self.resolver.key_set().is_none() => {
                return Err(AuthError::KeyFetchFailure("no key set available".into()))
            }
            None => return Err(AuthError::UnknownKey(kid.to_string())),
        };

        // 3. Signature
        if header.alg != key.algorithm() || !self.algorithms.contains(&header.alg) {
            debug!(
                kid = %kid,
                header_alg = ?header.alg,
                key_alg = ?key.algorithm(),
                "Token algorithm does not match key"
            );
            return Err(AuthError::BadSignature);
        }
        let message = &raw[..header_part.len() + 1 + payload_part.len()];
        match crypto::verify(signature, message.as_bytes(), key.decoding_key(), header.alg) {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::BadSignature),
            Err(e) => {
                debug!(kid = %kid, error = %e, "Signature check failed");
                return Err(AuthError::BadSignature);
            }
        }
        let claims: TokenClaims = serde_json::from_value(Value::Object(payload))
            .map_err(|e| AuthError::Malformed(format!("invalid claims: {}", e)))?;

        // 4. Issuer
        let issuer = match &claims.iss {
            Some(iss) if iss == expected_issuer => iss.clone(),
            _ => return Err(AuthError::IssuerMismatch),
        };

        // 5. Audience
        let audience = match &claims.aud {
            Some(aud) if aud.contains(expected_audience) => aud.clone(),
            _ => return Err(AuthError::AudienceMismatch),
        };

        // 6. Validity window
        let now = chrono::Utc::now().timestamp();
        let leeway = i64::try_from(self.leeway).unwrap_or(i64::MAX);
        let expires_at = claims
            .exp
            .map(|exp| i64::try_from(exp).unwrap_or(i64::MAX))
            .ok_or(AuthError::Expired)?;
        if now >= expires_at.saturating_add(leeway) {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            let nbf = i64::try_from(nbf).unwrap_or(i64::MAX);
            if now.saturating_add(leeway) < nbf {
                return Err(AuthError::Expired);
            }
        }

        Ok(ValidatedClaims::from_checked(claims, issuer, audience, expires_at))
    }
}

/// Decode the payload segment into a JSON object
fn decode_payload(segment: &str) -> Result<Map<String, Value>, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(format!("invalid payload encoding: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Malformed(format!("payload is not a JSON object: {}", e)))
}
