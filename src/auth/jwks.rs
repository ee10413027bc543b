//! JWKS (JSON Web Key Set) key resolution
//!
//! Fetches the identity provider's public signing keys and caches them by key
//! ID for token verification.
//!
//! # Cache model
//!
//! - A fetched key set is immutable and replaced wholesale on refresh; each
//!   replacement bumps the generation number.
//! - Readers take a short `parking_lot` read lock to clone the current
//!   `Arc<KeySet>`; no lock is held across an `.await` except the refresh gate.
//! - Concurrent callers that need a refresh queue on the gate. Whoever gets it
//!   first fetches; the rest observe that an attempt completed while they
//!   waited and reuse its result instead of fetching again.
//! - A failed refresh keeps the previous generation. Without one, lookups
//!   report not-found and verification fails closed.
//! - After a failed refresh, lookups do not fetch again until
//!   `min_refresh_interval` has passed; stale keys keep being served.
//!
//! # Example
//!
//! ```no_run
//! use komainu::auth::jwks::{HttpKeySetSource, KeyResolver, ResolverOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = HttpKeySetSource::new(
//!     "https://auth.example.com/.well-known/jwks.json",
//!     Duration::from_secs(5),
//! )?;
//! let resolver = KeyResolver::new(Arc::new(source), ResolverOptions::default());
//!
//! if let Some(key) = resolver.resolve("key-1").await {
//!     println!("resolved {} ({:?})", key.kid(), key.algorithm());
//! }
//! # Ok(())
//! # }
//! ```

use super::AuthError;
use crate::metrics;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A single JSON Web Key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA", "EC")
    pub kty: String,

    /// Key ID
    #[serde(default)]
    pub kid: Option<String>,

    /// Intended use ("sig" for signature)
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// Algorithm (e.g., "RS256", "ES256")
    #[serde(default)]
    pub alg: Option<String>,

    // RSA parameters
    /// RSA modulus (base64url encoded)
    #[serde(default)]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded)
    #[serde(default)]
    pub e: Option<String>,

    // EC parameters
    /// EC curve (e.g., "P-256")
    #[serde(default)]
    pub crv: Option<String>,

    /// EC x coordinate (base64url encoded)
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded)
    #[serde(default)]
    pub y: Option<String>,
}

impl Jwk {
    /// Convert JWK to DecodingKey
    pub fn to_decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_ref()
                    .ok_or_else(|| AuthError::Malformed("missing RSA modulus (n)".into()))?;
                let e = self
                    .e
                    .as_ref()
                    .ok_or_else(|| AuthError::Malformed("missing RSA exponent (e)".into()))?;

                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| AuthError::Malformed(format!("invalid RSA key: {}", e)))
            }
            "EC" => {
                let x = self
                    .x
                    .as_ref()
                    .ok_or_else(|| AuthError::Malformed("missing EC x coordinate".into()))?;
                let y = self
                    .y
                    .as_ref()
                    .ok_or_else(|| AuthError::Malformed("missing EC y coordinate".into()))?;

                DecodingKey::from_ec_components(x, y)
                    .map_err(|e| AuthError::Malformed(format!("invalid EC key: {}", e)))
            }
            other => Err(AuthError::Malformed(format!(
                "unsupported key type: {}",
                other
            ))),
        }
    }

    /// Signing algorithm for this key.
    ///
    /// Uses `alg` when published, otherwise the family default for `kty`/`crv`.
    pub fn algorithm(&self) -> Option<Algorithm> {
        if let Some(alg) = &self.alg {
            return parse_algorithm(alg);
        }
        match (self.kty.as_str(), self.crv.as_deref()) {
            ("RSA", _) => Some(Algorithm::RS256),
            ("EC", Some("P-256")) => Some(Algorithm::ES256),
            ("EC", Some("P-384")) => Some(Algorithm::ES384),
            _ => None,
        }
    }
}

/// Parse an asymmetric JWS algorithm name.
///
/// HMAC algorithms are deliberately absent: a public key set can never
/// verify them.
pub fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "RS256" => Some(Algorithm::RS256),
        "RS384" => Some(Algorithm::RS384),
        "RS512" => Some(Algorithm::RS512),
        "PS256" => Some(Algorithm::PS256),
        "PS384" => Some(Algorithm::PS384),
        "PS512" => Some(Algorithm::PS512),
        "ES256" => Some(Algorithm::ES256),
        "ES384" => Some(Algorithm::ES384),
        _ => None,
    }
}

/// JSON Web Key Set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A usable verification key taken from the key set
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// One generation of the provider's key set
#[derive(Debug)]
pub struct KeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
    generation: u64,
    fetched_at: Instant,
}

impl KeySet {
    /// Index the usable keys of a JWKS document by key ID
    pub fn from_jwks(jwks: Jwks, generation: u64) -> Self {
        let mut keys = HashMap::with_capacity(jwks.keys.len());

        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                debug!(kty = %jwk.kty, "Skipping key without kid");
                continue;
            };
            if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
                debug!(kid = %kid, "Skipping non-signature key");
                continue;
            }
            let Some(algorithm) = jwk.algorithm() else {
                debug!(kid = %kid, alg = ?jwk.alg, "Skipping key with unsupported algorithm");
                continue;
            };
            match jwk.to_decoding_key() {
                Ok(key) => {
                    keys.insert(
                        kid.clone(),
                        Arc::new(VerificationKey {
                            kid,
                            algorithm,
                            key,
                        }),
                    );
                }
                Err(e) => debug!(kid = %kid, error = %e, "Skipping unusable key"),
            }
        }

        Self {
            keys,
            generation,
            fetched_at: Instant::now(),
        }
    }

    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Where key sets come from
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Fetch the current key set
    async fn fetch(&self) -> Result<Jwks, AuthError>;
}

/// Fetches the key set from an HTTP(S) JWKS endpoint
pub struct HttpKeySetSource {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpKeySetSource {
    /// Create a source whose requests give up after `timeout`
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::KeyFetchFailure(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<Jwks, AuthError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetchFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::KeyFetchFailure(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        response
            .json::<Jwks>()
            .await
            .map_err(|e| AuthError::KeyFetchFailure(e.to_string()))
    }
}

/// Serves a fixed key set, e.g. one pinned in configuration
pub struct StaticKeySetSource {
    jwks: Jwks,
}

impl StaticKeySetSource {
    pub fn new(jwks: Jwks) -> Self {
        Self { jwks }
    }

    /// Parse a JWKS document
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        let jwks: Jwks =
            serde_json::from_str(json).map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok(Self { jwks })
    }
}

#[async_trait]
impl KeySetSource for StaticKeySetSource {
    async fn fetch(&self) -> Result<Jwks, AuthError> {
        Ok(self.jwks.clone())
    }
}

/// Retry policy for key set fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Key resolver tuning
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// How long a fetched key set is served before it is refetched
    pub cache_ttl: Duration,
    /// Minimum age of the key set before an unknown `kid` may trigger a
    /// refetch, and the cool-down after a failed fetch before lookups retry
    pub min_refresh_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            min_refresh_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshReason {
    Empty,
    Stale,
    Miss,
    Forced,
}

/// Caching resolver from key ID to verification key
pub struct KeyResolver {
    source: Arc<dyn KeySetSource>,
    options: ResolverOptions,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh_gate: tokio::sync::Mutex<()>,
    /// Completed fetch attempts, successful or not
    attempts: AtomicU64,
    /// When the last fetch attempt failed; cleared on success
    last_failure: RwLock<Option<Instant>>,
}

impl KeyResolver {
    pub fn new(source: Arc<dyn KeySetSource>, options: ResolverOptions) -> Self {
        Self {
            source,
            options,
            current: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// The key set currently served, if any has been fetched
    pub fn key_set(&self) -> Option<Arc<KeySet>> {
        self.current.read().clone()
    }

    /// Resolve a key ID to a verification key.
    ///
    /// A miss triggers at most one refetch (subject to the refresh interval)
    /// before `None` is reported.
    pub async fn resolve(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        let snapshot = self.key_set();

        let reason = match &snapshot {
            None => RefreshReason::Empty,
            Some(set) if set.age() >= self.options.cache_ttl => RefreshReason::Stale,
            Some(set) => match set.get(kid) {
                Some(key) => return Some(key),
                None => RefreshReason::Miss,
            },
        };

        debug!(kid = %kid, reason = ?reason, "Key set refresh needed");
        let seen = snapshot.as_ref().map(|set| set.generation());
        self.refresh_for(reason, seen)
            .await
            .and_then(|set| set.get(kid))
    }

    /// Fetch a new key set generation now.
    ///
    /// Callers racing with an in-flight refresh share its outcome.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let seen = self.key_set().map(|set| set.generation());
        self.refresh_for(RefreshReason::Forced, seen)
            .await
            .ok_or_else(|| AuthError::KeyFetchFailure("no key set available".into()))
    }

    async fn refresh_for(
        &self,
        reason: RefreshReason,
        seen_generation: Option<u64>,
    ) -> Option<Arc<KeySet>> {
        let seen_attempts = self.attempts.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        let current = self.key_set();

        // Someone fetched while we were queued on the gate.
        if self.attempts.load(Ordering::Acquire) != seen_attempts
            || current.as_ref().map(|set| set.generation()) != seen_generation
        {
            return current;
        }

        if reason != RefreshReason::Forced && self.failed_recently() {
            debug!(
                reason = ?reason,
                "Key set fetch failed recently; serving current generation"
            );
            return current;
        }

        if reason == RefreshReason::Miss {
            if let Some(set) = &current {
                if set.age() < self.options.min_refresh_interval {
                    debug!(
                        generation = set.generation(),
                        "Key set refreshed recently; not refetching for unknown kid"
                    );
                    return current;
                }
            }
        }

        let result = self.fetch_with_retry().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(jwks) => {
                let generation = current.as_ref().map_or(1, |set| set.generation() + 1);
                let set = Arc::new(KeySet::from_jwks(jwks, generation));
                info!(
                    generation,
                    keys = set.len(),
                    reason = ?reason,
                    "Key set refreshed"
                );
                metrics::record_key_set_generation(generation);
                *self.last_failure.write() = None;
                *self.current.write() = Some(Arc::clone(&set));
                Some(set)
            }
            Err(e) => {
                *self.last_failure.write() = Some(Instant::now());
                match &current {
                    Some(set) => warn!(
                        error = %e,
                        generation = set.generation(),
                        "Key set refresh failed; keeping previous generation"
                    ),
                    None => warn!(error = %e, "Key set refresh failed; no keys available"),
                }
                current
            }
        }
    }

    fn failed_recently(&self) -> bool {
        self.last_failure
            .read()
            .is_some_and(|at| at.elapsed() < self.options.min_refresh_interval)
    }

    async fn fetch_with_retry(&self) -> Result<Jwks, AuthError> {
        let policy = &self.options.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.source.fetch().await {
                Ok(jwks) => {
                    metrics::record_key_fetch(true);
                    return Ok(jwks);
                }
                Err(e) => {
                    metrics::record_key_fetch(false);
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    warn!(attempt, max_attempts, error = %e, "Key set fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}
