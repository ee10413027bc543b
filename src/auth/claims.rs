//! Token claims
//!
//! [`TokenClaims`] is the wire shape of a token payload and carries no trust.
//! [`ValidatedClaims`] is only produced by the verifier once signature,
//! issuer, audience and validity window have all been checked.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// `aud` claim, which may be a single string or an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Audience::One(aud) => vec![aud],
            Audience::Many(auds) => auds,
        }
    }
}

/// JWT payload as presented by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub exp: Option<u64>,
    #[serde(default)]
    pub nbf: Option<u64>,
    #[serde(default)]
    pub iat: Option<u64>,
    /// Canonical permission claim consulted by the authorization gate
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Space-delimited OAuth scope; kept for display only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Claim set of a token that passed verification
///
/// Lives for the duration of one request. There is no public constructor.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedClaims {
    subject: String,
    issuer: String,
    audiences: Vec<String>,
    expires_at: i64,
    issued_at: Option<i64>,
    permissions: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl ValidatedClaims {
    /// Build from a payload whose checks the verifier has already run.
    pub(super) fn from_checked(
        claims: TokenClaims,
        issuer: String,
        audience: Audience,
        expires_at: i64,
    ) -> Self {
        Self {
            subject: claims.sub,
            issuer,
            audiences: audience.into_vec(),
            expires_at,
            issued_at: claims.iat.and_then(|iat| i64::try_from(iat).ok()),
            permissions: claims.permissions.into_iter().collect(),
            scope: claims.scope,
            extra: claims.extra,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    /// Expiry as seconds since the Unix epoch
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn issued_at(&self) -> Option<i64> {
        self.issued_at
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Non-registered claims, e.g. provider namespaced ones
    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.extra.get(name)
    }

    #[cfg(test)]
    pub(crate) fn for_test(subject: &str, permissions: &[&str]) -> Self {
        Self {
            subject: subject.to_string(),
            issuer: "https://issuer.test/".to_string(),
            audiences: vec!["https://api.test".to_string()],
            expires_at: i64::MAX,
            issued_at: None,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            scope: None,
            extra: serde_json::Map::new(),
        }
    }
}
