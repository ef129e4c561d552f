//! AuthGate integration tests against a mock key-set endpoint.
//!
//! These wire the real key source, verifier and session cache together
//! without the HTTP layer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use gate_test_utils::{tamper_signature, MockJwksServer, TestKeypair, TestTokenBuilder};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};
use session_gate::auth::{
    AuthDecision, AuthGate, CacheInvalidationPolicy, DenyReason, KeySource, KeySourceConfig,
    SessionCache, SessionCacheConfig, TokenVerifier, VerifierConfig,
};
use std::sync::Arc;
use std::time::Duration;

const ISSUER: &str = "https://issuer.test";
const AUDIENCE: &str = "app";

struct Harness {
    jwks: MockJwksServer,
    gate: AuthGate,
}

async fn harness(
    keys: &[&TestKeypair],
    clock_skew: Duration,
    max_entries: usize,
    policy: CacheInvalidationPolicy,
) -> Harness {
    let jwks = MockJwksServer::start(keys).await;
    let key_source = KeySource::from_url(
        jwks.url(),
        KeySourceConfig {
            min_refresh_interval: Duration::from_secs(1),
            ..KeySourceConfig::default()
        },
    );
    let mut verifier_config = VerifierConfig::new(ISSUER);
    verifier_config.clock_skew = clock_skew;
    let verifier = Arc::new(TokenVerifier::new(key_source.clone(), verifier_config));
    let cache = Arc::new(SessionCache::new(SessionCacheConfig {
        max_entries,
        ..SessionCacheConfig::default()
    }));

    Harness {
        jwks,
        gate: AuthGate::new(key_source, verifier, cache, AUDIENCE.to_string(), policy),
    }
}

async fn default_harness(keys: &[&TestKeypair]) -> Harness {
    harness(
        keys,
        Duration::from_secs(5),
        100,
        CacheInvalidationPolicy::OnKeySetChange,
    )
    .await
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

fn token_for(key: &TestKeypair, subject: &str) -> String {
    TestTokenBuilder::new(key)
        .issuer(ISSUER)
        .audience(AUDIENCE)
        .subject(subject)
        .expires_in_secs(3600)
        .build()
}

fn denied(decision: &AuthDecision) -> Option<DenyReason> {
    match decision {
        AuthDecision::Denied(reason) => Some(*reason),
        AuthDecision::Allowed(_) => None,
    }
}

#[tokio::test]
async fn test_end_to_end_decisions() {
    let key = TestKeypair::new(1, "k1");
    let h = harness(
        &[&key],
        Duration::ZERO,
        100,
        CacheInvalidationPolicy::OnKeySetChange,
    )
    .await;
    let now = Utc::now().timestamp();

    let valid = token_for(&key, "user_1");
    let decision = h.gate.authorize(&bearer(&valid)).await;
    match decision {
        AuthDecision::Allowed(claims) => assert_eq!(claims.subject, "user_1"),
        AuthDecision::Denied(reason) => panic!("expected Allowed, got {reason:?}"),
    }

    let tampered = tamper_signature(&token_for(&key, "user_2"));
    assert_eq!(
        denied(&h.gate.authorize(&bearer(&tampered)).await),
        Some(DenyReason::BadSignature)
    );

    let wrong_issuer = TestTokenBuilder::new(&key)
        .issuer("https://other.test")
        .audience(AUDIENCE)
        .expires_in_secs(3600)
        .build();
    assert_eq!(
        denied(&h.gate.authorize(&bearer(&wrong_issuer)).await),
        Some(DenyReason::WrongIssuer)
    );

    let just_expired = TestTokenBuilder::new(&key)
        .issuer(ISSUER)
        .audience(AUDIENCE)
        .issued_at(now - 60)
        .expires_at(now - 2)
        .build();
    assert_eq!(
        denied(&h.gate.authorize(&bearer(&just_expired)).await),
        Some(DenyReason::Expired)
    );
}

#[tokio::test]
async fn test_clock_skew_admits_recently_expired_token() {
    let key = TestKeypair::new(1, "k1");
    let h = harness(
        &[&key],
        Duration::from_secs(5),
        100,
        CacheInvalidationPolicy::OnKeySetChange,
    )
    .await;
    let now = Utc::now().timestamp();

    let token = TestTokenBuilder::new(&key)
        .issuer(ISSUER)
        .audience(AUDIENCE)
        .issued_at(now - 60)
        .expires_at(now - 2)
        .build();

    assert!(h.gate.authorize(&bearer(&token)).await.is_allowed());
}

#[tokio::test]
async fn test_symmetric_algorithm_is_rejected() {
    let key = TestKeypair::new(1, "k1");
    let h = default_harness(&[&key]).await;

    let token = token_for(&key, "user_1");
    let (_, rest) = token.split_once('.').unwrap();
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT","kid":"k1"}"#);
    let forged = format!("{header}.{rest}");

    assert_eq!(
        denied(&h.gate.authorize(&bearer(&forged)).await),
        Some(DenyReason::UnsupportedAlgorithm)
    );
    // Rejected before any key lookup
    assert_eq!(h.jwks.request_count().await, 0);
}

#[tokio::test]
async fn test_missing_credential_is_denied() {
    let key = TestKeypair::new(1, "k1");
    let h = default_harness(&[&key]).await;

    assert_eq!(
        denied(&h.gate.authorize(&HeaderMap::new()).await),
        Some(DenyReason::NoCredential)
    );
}

#[tokio::test]
async fn test_repeated_authorization_is_idempotent() {
    let key = TestKeypair::new(1, "k1");
    let h = default_harness(&[&key]).await;
    let token = token_for(&key, "user_1");

    let first = h.gate.authorize(&bearer(&token)).await;
    let second = h.gate.authorize(&bearer(&token)).await;

    assert!(first.is_allowed());
    assert_eq!(first, second);
    assert_eq!(h.gate.cache().len(), 1);
    assert_eq!(h.jwks.request_count().await, 1);
}

#[tokio::test]
async fn test_cache_never_exceeds_max_entries() {
    let key = TestKeypair::new(1, "k1");
    let h = harness(
        &[&key],
        Duration::from_secs(5),
        3,
        CacheInvalidationPolicy::OnKeySetChange,
    )
    .await;

    for i in 0..10 {
        let token = token_for(&key, &format!("user_{i}"));
        assert!(h.gate.authorize(&bearer(&token)).await.is_allowed());
        assert!(h.gate.cache().len() <= 3);
    }
    assert_eq!(h.gate.cache().len(), 3);
}

#[tokio::test]
async fn test_key_set_change_invalidates_cache() {
    let k1 = TestKeypair::new(1, "k1");
    let k2 = TestKeypair::new(2, "k2");
    let h = default_harness(&[&k1]).await;

    let token = token_for(&k1, "user_1");
    assert!(h.gate.authorize(&bearer(&token)).await.is_allowed());
    assert_eq!(h.gate.cache().len(), 1);

    // Provider drops k1 and publishes k2
    h.jwks.publish(&[&k2]).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.gate.key_source().refresh().await.unwrap();
    assert_eq!(h.gate.key_source().version(), 2);

    // The cached Allowed for the k1 token must not survive the change
    assert_eq!(
        denied(&h.gate.authorize(&bearer(&token)).await),
        Some(DenyReason::UnknownKey)
    );
}

#[tokio::test]
async fn test_never_policy_keeps_cached_results() {
    let k1 = TestKeypair::new(1, "k1");
    let k2 = TestKeypair::new(2, "k2");
    let h = harness(
        &[&k1],
        Duration::from_secs(5),
        100,
        CacheInvalidationPolicy::Never,
    )
    .await;

    let token = token_for(&k1, "user_1");
    assert!(h.gate.authorize(&bearer(&token)).await.is_allowed());

    h.jwks.publish(&[&k2]).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.gate.key_source().refresh().await.unwrap();

    assert!(h.gate.authorize(&bearer(&token)).await.is_allowed());
    assert_eq!(h.jwks.request_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_requests_for_rotated_kid_share_one_fetch() {
    let k1 = TestKeypair::new(1, "k1");
    let k2 = TestKeypair::new(2, "k2");
    let h = default_harness(&[&k1]).await;

    // Load the initial key set
    assert!(h.gate.authorize(&bearer(&token_for(&k1, "user_0"))).await.is_allowed());

    // k2 is unknown to the gate until the next fetch
    h.jwks.publish(&[&k1, &k2]).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let requests: Vec<HeaderMap> = (1..=8)
        .map(|i| bearer(&token_for(&k2, &format!("user_{i}"))))
        .collect();
    let decisions =
        futures::future::join_all(requests.iter().map(|headers| h.gate.authorize(headers)))
            .await;

    assert!(decisions.iter().all(AuthDecision::is_allowed));
    assert_eq!(h.jwks.request_count().await, 1);
    assert_eq!(h.gate.key_source().version(), 2);
}
