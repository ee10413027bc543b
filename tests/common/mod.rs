//! Shared fixtures for integration tests
//!
//! Two RSA signing keys (A and B), helpers to mint tokens with them and a
//! wiremock JWKS endpoint.

#![allow(dead_code)]

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use komainu::auth::{HttpKeySetSource, KeyResolver, ResolverOptions, TokenVerifier};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SIGNING_KEY_A: &str = include_str!("../fixtures/signing_key_a.pem");
pub const SIGNING_KEY_B: &str = include_str!("../fixtures/signing_key_b.pem");

/// Base64url modulus of key A's public half
pub const MODULUS_A: &str = "tc-F0cad7-y-ktawZaEr-1BkTxOIpI1umWd7MnlLbVYgGIL26zh6TzTQuiPrkzaltcv08plvh3ZCojCn7unpVyD-peKnch2LzpTQEAvS3yz2EBPkXOAcs8etKyNiUzLOLa0FF188_4PODQuMSXcVkyoFb4gLDs2-KjwANG_kodLTT_2EPNrP7fOmU0fAoyoqEmxwfbL2rbe1GR9yvoXIl0DobbrFYoua6S9WfqjbzeZ53GNIw1jUuisyFMqBWjdu3GZkdS-vwmNnV3n2M1KaOW3Iz5cPqU_vhoZ8FNwbyhmgddoc3a40rVGVUviKBE1jjVCLQ0qVpII5kqhicxvIOw";
/// Base64url modulus of key B's public half
pub const MODULUS_B: &str = "n1jJg4a3GwpIpkkmjVjqyXx-tbgV1NuhnMEz_jadORFWlTyAWjNJULNN6EZn_ZtABue-F7QvlMgkMwl7fpQRip3cNPGExWkMI6fsB9olLKwfT_VZKISwKhadMxxbXHGQu1MGb3yJ3XdGSSJKc7BT5xtpVS0lTAK0fqCe1Ooab0fXqXnQ542-gGKUvAJ8w9uok4UYlBqniP0fLevHf_-F7uUTvqrxbOlXJNvb22mmj7DZUreqEBRKFfD7AZAY88H0wcRJACgMOe-tAB6HVmRVG7n41-gbPl3v_V_w5LcC0PNQVsoHadGxnOZeMyY4jDYElNwq-uvJth7zLHpT5ktgEw";

pub const KID_A: &str = "key-a";
pub const KID_B: &str = "key-b";

pub const ISSUER: &str = "https://tenant.example.com/";
pub const AUDIENCE: &str = "https://api.example.com";

pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// JWKS document with the given `(kid, modulus)` RSA keys
pub fn jwks(keys: &[(&str, &str)]) -> Value {
    let keys: Vec<Value> = keys
        .iter()
        .map(|(kid, n)| {
            json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": n,
                "e": "AQAB",
            })
        })
        .collect();
    json!({ "keys": keys })
}

/// Claims for the test issuer/audience expiring `exp_offset` seconds from now
pub fn claims(permissions: &[&str], exp_offset: i64) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "sub": "auth0|user-1",
        "iss": ISSUER,
        "aud": [AUDIENCE, "https://tenant.example.com/userinfo"],
        "iat": now,
        "exp": now + exp_offset,
        "scope": "openid profile",
        "permissions": permissions,
    })
}

/// Sign `claims` with an RSA private key under `kid`
pub fn sign(private_key_pem: &str, kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).unwrap(),
    )
    .unwrap()
}

/// Token signed with key A carrying `permissions`, valid for an hour
pub fn token_a(permissions: &[&str]) -> String {
    sign(SIGNING_KEY_A, KID_A, &claims(permissions, 3600))
}

/// Mock JWKS endpoint serving `body`
pub async fn jwks_server(body: Value) -> MockServer {
    let server = MockServer::start().await;
    mount_jwks(&server, body, None).await;
    server
}

/// Mount a JWKS response; `expect` pins the exact number of fetches
pub async fn mount_jwks(server: &MockServer, body: Value, expect: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body));
    match expect {
        Some(n) => mock.expect(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

/// Resolver options that never wait long
pub fn fast_options() -> ResolverOptions {
    let mut options = ResolverOptions::default();
    options.retry.initial_backoff = Duration::from_millis(1);
    options.retry.max_backoff = Duration::from_millis(5);
    options
}

/// Resolver and verifier backed by the mock server's JWKS endpoint
pub fn verifier_for(server: &MockServer, options: ResolverOptions) -> TokenVerifier {
    let source = HttpKeySetSource::new(
        &format!("{}{}", server.uri(), JWKS_PATH),
        Duration::from_secs(2),
    )
    .unwrap();
    let resolver = KeyResolver::new(Arc::new(source), options);
    TokenVerifier::new(Arc::new(resolver), ISSUER, AUDIENCE)
}
