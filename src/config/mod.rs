//! Configuration module for Komainu
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and comprehensive validation.

use crate::auth::jwks::{parse_algorithm, ResolverOptions, RetryPolicy};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("environment variable pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |cap: &regex_lite::Captures<'_>| {
            match std::env::var(&cap[1]) {
                Ok(value) => value,
                Err(_) => match cap.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => cap[0].to_string(),
                },
            }
        })
        .into_owned()
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid server address '{}'",
                self.server.address
            )));
        }

        self.auth.validate()?;

        if self.routes.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one route must be configured".into(),
            ));
        }

        let mut prefixes = HashSet::new();
        for route in &self.routes {
            if route.path_prefix.is_empty() || !route.path_prefix.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Route '{}' must have a path_prefix starting with '/'",
                    route.name
                )));
            }
            if !prefixes.insert(route.normalized_prefix()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate path_prefix '{}'",
                    route.path_prefix
                )));
            }
            if route.public && !route.permissions.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Public route '{}' cannot require permissions",
                    route.name
                )));
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Expected `iss` claim, compared exactly (trailing slash included)
    pub issuer: String,
    /// Expected entry in the `aud` claim
    pub audience: String,
    /// JWKS endpoint. Default: `<issuer>/.well-known/jwks.json`
    #[serde(default)]
    pub jwks_url: Option<String>,
    /// Accepted signing algorithms. Default: `[RS256]`
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,
    /// Allowed clock skew for `exp`/`nbf` in seconds. Default: 0
    #[serde(default)]
    pub leeway_seconds: u64,
    #[serde(default)]
    pub jwks: JwksConfig,
}

impl AuthConfig {
    /// JWKS endpoint, derived from the issuer unless set explicitly
    pub fn jwks_url(&self) -> String {
        match &self.jwks_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/.well-known/jwks.json",
                self.issuer.trim_end_matches('/')
            ),
        }
    }

    /// Parsed signing algorithms.
    ///
    /// Unknown names are dropped here; `validate` rejects them up front.
    pub fn algorithms(&self) -> Vec<jsonwebtoken::Algorithm> {
        self.algorithms
            .iter()
            .filter_map(|alg| parse_algorithm(alg))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.issuer) {
            return Err(ConfigError::ValidationError(
                "Invalid issuer: must start with http:// or https://".into(),
            ));
        }
        if self.audience.trim().is_empty() {
            return Err(ConfigError::ValidationError("Audience cannot be empty".into()));
        }
        if let Some(url) = &self.jwks_url {
            if !is_valid_http_url(url) {
                return Err(ConfigError::ValidationError(
                    "Invalid jwks_url: must start with http:// or https://".into(),
                ));
            }
        }
        if self.algorithms.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one signing algorithm must be configured".into(),
            ));
        }
        for alg in &self.algorithms {
            if parse_algorithm(alg).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Unsupported algorithm '{}': must be an RSA or EC algorithm",
                    alg
                )));
            }
        }
        if self.jwks.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "jwks.retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

/// Key set cache and fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_min_refresh_interval")]
    pub min_refresh_interval_seconds: u64,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl(),
            min_refresh_interval_seconds: default_min_refresh_interval(),
            timeout_ms: default_fetch_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl JwksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
            min_refresh_interval: Duration::from_secs(self.min_refresh_interval_seconds),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            },
        }
    }
}

fn default_cache_ttl() -> u64 {
    600
}

fn default_min_refresh_interval() -> u64 {
    5
}

fn default_fetch_timeout() -> u64 {
    5000
}

/// Backoff for failed key set fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2000
}

/// A protected (or public) API route
///
/// # Example
///
/// ```yaml
/// routes:
///   - name: messages
///     path_prefix: /api/messages
///     methods: [GET]
///     permissions: ["read:messages"]
///     message: "The API successfully validated your access token."
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub path_prefix: String,
    /// Allowed methods; empty allows any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Serve without a token
    #[serde(default)]
    pub public: bool,
    /// Permissions the token must carry
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Body message for the built-in handler
    #[serde(default)]
    pub message: Option<String>,
}

impl RouteConfig {
    /// Path prefix without trailing slashes, except for the root `/`
    pub fn normalized_prefix(&self) -> &str {
        match self.path_prefix.trim_end_matches('/') {
            "" if self.path_prefix.starts_with('/') => "/",
            trimmed => trimmed,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
