//! Identity provider integration
//!
//! Authorization code flow with PKCE (S256). The return destination of a
//! login is bound to its `state` value and restored when the callback echoes
//! that value back.

use super::{
    AuthState, LoginRedirector, PendingLogin, Session, SessionError, SessionStore, TokenRefresher,
    TokenSet, UserProfile,
};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything except RFC 3986 unreserved characters
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const DEFAULT_SCOPE: &str = "openid profile email";

fn encode(value: &str) -> String {
    utf8_percent_encode(value, QUERY_COMPONENT).to_string()
}

/// Provider settings as supplied by the application; any field may be missing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl ProviderConfig {
    /// Read `KOMAINU_AUTH_DOMAIN`, `KOMAINU_AUTH_CLIENT_ID`,
    /// `KOMAINU_AUTH_CALLBACK_URL`, `KOMAINU_AUTH_AUDIENCE` and
    /// `KOMAINU_AUTH_SCOPE`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            domain: var("KOMAINU_AUTH_DOMAIN"),
            client_id: var("KOMAINU_AUTH_CLIENT_ID"),
            callback_url: var("KOMAINU_AUTH_CALLBACK_URL"),
            audience: var("KOMAINU_AUTH_AUDIENCE"),
            scope: var("KOMAINU_AUTH_SCOPE"),
        }
    }

    /// Complete settings, or `None` when domain, client id or callback URL
    /// is missing or blank.
    pub fn resolve(&self) -> Option<ProviderSettings> {
        let required = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Some(ProviderSettings {
            domain: required(&self.domain)?,
            client_id: required(&self.client_id)?,
            callback_url: required(&self.callback_url)?,
            audience: required(&self.audience),
            scope: required(&self.scope).unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        })
    }
}

/// Complete provider settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub domain: String,
    pub client_id: String,
    pub callback_url: String,
    pub audience: Option<String>,
    pub scope: String,
}

impl ProviderSettings {
    /// `https://<domain>`; a domain that already names a scheme is kept as is
    pub fn base_url(&self) -> String {
        if self.domain.starts_with("https://") || self.domain.starts_with("http://") {
            self.domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.domain.trim_end_matches('/'))
        }
    }

    pub fn authorize_url(&self, request: &LoginRequest) -> String {
        let mut url = format!(
            "{}/authorize?response_type=code&client_id={}&redirect_uri={}&scope={}",
            self.base_url(),
            encode(&self.client_id),
            encode(&self.callback_url),
            encode(&self.scope),
        );
        if let Some(audience) = &self.audience {
            url.push_str("&audience=");
            url.push_str(&encode(audience));
        }
        url.push_str("&state=");
        url.push_str(&encode(&request.state));
        url.push_str("&code_challenge=");
        url.push_str(&request.code_challenge());
        url.push_str("&code_challenge_method=S256");
        url
    }

    pub fn logout_url(&self, return_to: &str) -> String {
        format!(
            "{}/v2/logout?client_id={}&returnTo={}",
            self.base_url(),
            encode(&self.client_id),
            encode(return_to),
        )
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.base_url())
    }
}

/// One login attempt: CSRF state plus PKCE verifier
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub state: String,
    pub code_verifier: String,
}

impl LoginRequest {
    pub fn new() -> Self {
        Self {
            state: Uuid::new_v4().simple().to_string(),
            // 64 characters, inside the 43..=128 range PKCE allows
            code_verifier: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
        }
    }

    /// BASE64URL(SHA256(verifier)) without padding
    pub fn code_challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.code_verifier.as_bytes()))
    }
}

impl Default for LoginRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode the profile from an ID token's payload.
///
/// The token comes straight from the token endpoint over TLS, so the
/// signature is not checked here.
pub(crate) fn profile_from_id_token(id_token: &str) -> Result<UserProfile, SessionError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| SessionError::InvalidCallback("ID token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| SessionError::InvalidCallback(format!("ID token payload: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::InvalidCallback(format!("ID token claims: {}", e)))
}

/// Split a callback query string into decoded pairs
fn parse_query(query: &str) -> Vec<(String, String)> {
    let decode = |s: &str| {
        let s = s.replace('+', " ");
        percent_decode_str(&s).decode_utf8_lossy().into_owned()
    };
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

/// Client handle on the provider and the local session
pub struct SessionHandle {
    settings: ProviderSettings,
    store: Arc<dyn SessionStore>,
    redirector: Arc<dyn LoginRedirector>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Wrap the provider: a handle when the configuration is complete, else `None`
pub fn provide(
    config: &ProviderConfig,
    store: Arc<dyn SessionStore>,
    redirector: Arc<dyn LoginRedirector>,
    refresher: Arc<dyn TokenRefresher>,
) -> Option<SessionHandle> {
    match config.resolve() {
        Some(settings) => Some(SessionHandle::new(settings, store, redirector, refresher)),
        None => {
            warn!("Identity provider configuration incomplete; sessions disabled");
            None
        }
    }
}

impl SessionHandle {
    pub fn new(
        settings: ProviderSettings,
        store: Arc<dyn SessionStore>,
        redirector: Arc<dyn LoginRedirector>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            settings,
            store,
            redirector,
            refresher,
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Start a redirect login that returns to `return_to` afterwards.
    ///
    /// Returns the authorize URL handed to the redirector.
    pub fn login(&self, return_to: &str) -> String {
        let request = LoginRequest::new();
        let url = self.settings.authorize_url(&request);

        self.store.save_pending(
            &request.state,
            PendingLogin {
                code_verifier: request.code_verifier,
                return_to: return_to.to_string(),
                created_at: Utc::now(),
            },
        );

        info!(return_to = %return_to, "Redirecting to identity provider");
        self.redirector.redirect(&url);
        url
    }

    /// Complete a login from the callback query string.
    ///
    /// Returns the destination recorded when the login started.
    pub async fn handle_callback(&self, query: &str) -> Result<String, SessionError> {
        let params = parse_query(query);
        let param = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        if let Some(error) = param("error") {
            let description = param("error_description").unwrap_or(error);
            warn!(error = %error, "Identity provider rejected login");
            return Err(SessionError::ProviderError(description.to_string()));
        }

        let state = param("state")
            .ok_or_else(|| SessionError::InvalidCallback("missing state".into()))?;
        let code = param("code")
            .ok_or_else(|| SessionError::InvalidCallback("missing code".into()))?;

        let pending = self.store.take_pending(state).ok_or_else(|| {
            warn!("Callback state does not match a pending login");
            SessionError::InvalidState
        })?;

        let tokens = self
            .refresher
            .exchange_code(code, &pending.code_verifier, &self.settings.callback_url)
            .await?;
        let session = Session::from_tokens(tokens, Utc::now())?;

        info!(
            subject = session.profile.as_ref().map(|p| p.sub.as_str()).unwrap_or("<unknown>"),
            "Login completed"
        );
        self.store.save(session);
        Ok(pending.return_to)
    }

    /// Clear the local session and return the provider logout URL
    pub fn logout(&self, return_to: &str) -> String {
        self.store.clear();
        info!("Session cleared");
        self.settings.logout_url(return_to)
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.store.load().and_then(|session| session.profile)
    }

    /// Current access token, refreshed silently when expired.
    ///
    /// Concurrent callers share one refresh.
    pub async fn access_token(&self) -> Result<String, SessionError> {
        let session = self.store.load().ok_or(SessionError::NotAuthenticated)?;
        if !session.is_expired(Utc::now()) {
            return Ok(session.access_token);
        }

        let _gate = self.refresh_gate.lock().await;

        // Someone else may have refreshed while we waited
        let session = self.store.load().ok_or(SessionError::NotAuthenticated)?;
        if !session.is_expired(Utc::now()) {
            return Ok(session.access_token);
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            debug!("Access token expired and no refresh token held");
            self.store.clear();
            return Err(SessionError::SessionExpired);
        };

        match self.refresher.refresh(&refresh_token).await {
            Ok(tokens) => {
                let mut refreshed = Session::from_tokens(tokens, Utc::now())?;
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token);
                }
                if refreshed.profile.is_none() {
                    refreshed.profile = session.profile;
                }
                let token = refreshed.access_token.clone();
                self.store.save(refreshed);
                debug!("Access token refreshed");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Silent token refresh failed");
                self.store.clear();
                Err(SessionError::SessionExpired)
            }
        }
    }

    /// Check the local session, refreshing an expired one if possible
    pub async fn check_session(&self) -> AuthState {
        match self.access_token().await {
            Ok(_) => AuthState::Authenticated,
            Err(_) => AuthState::Unauthenticated,
        }
    }
}

/// [`TokenRefresher`] backed by the provider's `/oauth/token` endpoint
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
}

#[derive(Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum TokenRequest<'a> {
    AuthorizationCode {
        client_id: &'a str,
        code: &'a str,
        code_verifier: &'a str,
        redirect_uri: &'a str,
    },
    RefreshToken {
        client_id: &'a str,
        refresh_token: &'a str,
    },
}

impl HttpTokenRefresher {
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::ProviderError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token_url: settings.token_url(),
            client_id: settings.client_id.clone(),
        })
    }

    async fn request(&self, body: &TokenRequest<'_>) -> Result<TokenSet, SessionError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(body)
            .send()
            .await
            .map_err(|e| SessionError::ProviderError(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::ProviderError(format!(
                "token endpoint returned {}",
                status
            )));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| SessionError::ProviderError(format!("token response: {}", e)))
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, SessionError> {
        self.request(&TokenRequest::AuthorizationCode {
            client_id: &self.client_id,
            code,
            code_verifier,
            redirect_uri,
        })
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, SessionError> {
        self.request(&TokenRequest::RefreshToken {
            client_id: &self.client_id,
            refresh_token,
        })
        .await
    }
}
