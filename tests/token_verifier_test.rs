//! Token Verifier Integration Tests
//!
//! End-to-end verification of RS256 access tokens against a mock JWKS
//! endpoint, followed by the permission check.

mod common;

use common::*;
use komainu::auth::AuthError;
use komainu::authz::{authorize, Decision, PermissionRequirement};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ========================================================================
// Happy path
// ========================================================================

#[tokio::test]
async fn test_valid_token_verified_and_authorized() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let claims = verifier.verify(&token_a(&["read:posts"])).await.unwrap();

    assert_eq!(claims.subject(), "auth0|user-1");
    assert_eq!(claims.issuer(), ISSUER);
    assert_eq!(
        authorize(&claims, &PermissionRequirement::new(["read:posts"])),
        Decision::Allow
    );
}

#[tokio::test]
async fn test_empty_requirement_always_allows() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let claims = verifier.verify(&token_a(&[])).await.unwrap();
    assert!(authorize(&claims, &PermissionRequirement::none()).is_allowed());
}

#[tokio::test]
async fn test_missing_permission_reported() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let claims = verifier.verify(&token_a(&["read:posts"])).await.unwrap();
    let decision = authorize(&claims, &PermissionRequirement::new(["write:posts"]));

    assert_eq!(
        decision,
        Decision::Deny {
            missing: vec!["write:posts".to_string()]
        }
    );
    assert_eq!(
        decision.into_result(),
        Err(AuthError::InsufficientPermission(vec!["write:posts".to_string()]))
    );
}

#[tokio::test]
async fn test_scope_claim_does_not_grant_permissions() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let mut body = claims(&[], 3600);
    body["scope"] = json!("read:messages write:messages");
    let claims = verifier.verify(&sign(SIGNING_KEY_A, KID_A, &body)).await.unwrap();

    assert_eq!(claims.scope(), Some("read:messages write:messages"));
    assert!(!authorize(&claims, &PermissionRequirement::new(["read:messages"])).is_allowed());
}

// ========================================================================
// Rejections
// ========================================================================

#[tokio::test]
async fn test_unknown_key_after_one_refresh() {
    let server = MockServer::start().await;
    // Initial fetch only: the miss happens within the refresh interval
    mount_jwks(&server, jwks(&[(KID_A, MODULUS_A)]), Some(1)).await;
    let verifier = verifier_for(&server, fast_options());

    let token = sign(SIGNING_KEY_B, KID_B, &claims(&["read:posts"], 3600));
    assert_eq!(
        verifier.verify(&token).await.unwrap_err(),
        AuthError::UnknownKey(KID_B.to_string())
    );
}

#[tokio::test]
async fn test_signature_from_wrong_key_rejected() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    // Key B's signature presented under key A's kid
    let token = sign(SIGNING_KEY_B, KID_A, &claims(&["read:posts"], 3600));
    assert_eq!(verifier.verify(&token).await.unwrap_err(), AuthError::BadSignature);
}

#[tokio::test]
async fn test_tampered_payload_rejected() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let token = token_a(&["read:posts"]);
    let forged_claims = claims(&["admin"], 3600);
    let forged_payload = base64_url(&forged_claims.to_string());
    let mut parts: Vec<&str> = token.split('.').collect();
    parts[1] = &forged_payload;

    assert_eq!(
        verifier.verify(&parts.join(".")).await.unwrap_err(),
        AuthError::BadSignature
    );
}

#[tokio::test]
async fn test_wrong_audience_rejected_despite_valid_signature() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let mut body = claims(&["read:posts"], 3600);
    body["aud"] = json!("https://other-api.example.com");
    let token = sign(SIGNING_KEY_A, KID_A, &body);

    assert_eq!(
        verifier.verify(&token).await.unwrap_err(),
        AuthError::AudienceMismatch
    );
}

#[tokio::test]
async fn test_wrong_issuer_rejected() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let mut body = claims(&["read:posts"], 3600);
    body["iss"] = json!("https://tenant.example.com");
    let token = sign(SIGNING_KEY_A, KID_A, &body);

    assert_eq!(
        verifier.verify(&token).await.unwrap_err(),
        AuthError::IssuerMismatch
    );
}

#[tokio::test]
async fn test_expired_token_rejected_regardless_of_claims() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let token = sign(SIGNING_KEY_A, KID_A, &claims(&["read:posts", "admin"], -10));
    assert_eq!(verifier.verify(&token).await.unwrap_err(), AuthError::Expired);
}

#[tokio::test]
async fn test_replay_after_key_rotation_rejected() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    let token = token_a(&["read:posts"]);
    assert!(verifier.verify(&token).await.is_ok());

    // Provider rotates: key A removed, key B published
    server.reset().await;
    mount_jwks(&server, jwks(&[(KID_B, MODULUS_B)]), None).await;
    let set = verifier.resolver().refresh().await.unwrap();
    assert_eq!(set.generation(), 2);

    assert_eq!(
        verifier.verify(&token).await.unwrap_err(),
        AuthError::UnknownKey(KID_A.to_string())
    );

    let fresh = sign(SIGNING_KEY_B, KID_B, &claims(&["read:posts"], 3600));
    assert!(verifier.verify(&fresh).await.is_ok());
}

#[tokio::test]
async fn test_unreachable_key_set_fails_closed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let verifier = verifier_for(&server, fast_options());

    let result = verifier.verify(&token_a(&["read:posts"])).await;
    assert!(matches!(result, Err(AuthError::KeyFetchFailure(_))));
}

#[tokio::test]
async fn test_malformed_tokens_rejected() {
    let server = jwks_server(jwks(&[(KID_A, MODULUS_A)])).await;
    let verifier = verifier_for(&server, fast_options());

    for raw in ["", "abc", "a.b", "a..c", "a.b.c.d", "!!.??.**"] {
        let result = verifier.verify(raw).await;
        assert!(
            matches!(result, Err(AuthError::Malformed(_))),
            "{:?} gave {:?}",
            raw,
            result
        );
    }
}

fn base64_url(data: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(data)
}
