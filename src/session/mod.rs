//! Client-side session module
//!
//! Redirect login against the identity provider, local session state and a
//! route guard for protected views. The provider is reached only through the
//! [`LoginRedirector`], [`TokenRefresher`] and [`SessionStore`] seams, so
//! every piece can be driven by fakes.

pub mod guard;
pub mod provider;
pub mod store;

pub use guard::{GuardView, RouteGuard};
pub use provider::{
    provide, HttpTokenRefresher, LoginRequest, ProviderConfig, ProviderSettings, SessionHandle,
};
pub use store::MemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tokens within this many seconds of expiry count as expired
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Upper bound on a token lifetime taken from `expires_in`
const MAX_LIFETIME_SECS: i64 = 10 * 365 * 24 * 3600;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired and cannot be refreshed")]
    SessionExpired,

    #[error("Callback state does not match a pending login")]
    InvalidState,

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Identity provider error: {0}")]
    ProviderError(String),
}

/// Local authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Session check still running
    Unknown,
    Unauthenticated,
    Authenticated,
}

/// Profile of the signed-in user, read from the ID token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Token endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// A signed-in session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub profile: Option<UserProfile>,
}

impl Session {
    /// Build a session from a token response issued at `now`
    pub fn from_tokens(tokens: TokenSet, now: DateTime<Utc>) -> Result<Self, SessionError> {
        let profile = match tokens.id_token.as_deref() {
            Some(id_token) => Some(provider::profile_from_id_token(id_token)?),
            None => None,
        };
        let lifetime = i64::try_from(tokens.expires_in)
            .unwrap_or(MAX_LIFETIME_SECS)
            .min(MAX_LIFETIME_SECS);

        Ok(Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: now + Duration::seconds(lifetime),
            profile,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Login started but not yet completed by a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub code_verifier: String,
    pub return_to: String,
    pub created_at: DateTime<Utc>,
}

/// Sends the user agent to the provider
#[cfg_attr(test, mockall::automock)]
pub trait LoginRedirector: Send + Sync {
    fn redirect(&self, url: &str);
}

/// Talks to the provider's token endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange an authorization code (with its PKCE verifier) for tokens
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, SessionError>;

    /// Obtain a fresh access token without user interaction
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, SessionError>;
}

/// Local session persistence
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Option<Session>;
    fn save(&self, session: Session);
    fn clear(&self);
    fn save_pending(&self, state: &str, pending: PendingLogin);
    /// Remove and return the pending login for `state`
    fn take_pending(&self, state: &str) -> Option<PendingLogin>;
}
