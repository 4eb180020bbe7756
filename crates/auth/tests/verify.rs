use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use robokache_auth::{AuthError, IdentityVerifier, KeySet, KeySetFetcher, VerifierConfig};
use robokache_contracts::Principal;
use serde_json::{Value, json};

const AUDIENCE: &str = "robokache-test-client";
const ISSUER: &str = "https://accounts.google.com";

struct FixtureFetcher {
    body: Option<&'static [u8]>,
    calls: AtomicUsize,
}

impl FixtureFetcher {
    fn serving(body: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            body: Some(body),
            calls: AtomicUsize::new(0),
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            body: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetFetcher for FixtureFetcher {
    async fn fetch(&self, _url: &str) -> Result<KeySet, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.body {
            Some(body) => KeySet::from_json(body),
            None => Err(AuthError::KeyFetchFailed("connection refused".to_string())),
        }
    }
}

fn jwks() -> &'static [u8] {
    include_bytes!("fixtures/test_jwks.json")
}

fn config(cache_ttl: Duration) -> VerifierConfig {
    VerifierConfig {
        audience: AUDIENCE.to_string(),
        issuers: vec!["accounts.google.com".to_string(), ISSUER.to_string()],
        keys_url: "https://keys.invalid/certs".to_string(),
        keys_timeout: Duration::from_millis(2000),
        keys_cache_ttl: cache_ttl,
        keys_min_refresh: Duration::ZERO,
        clock_skew: Duration::from_secs(0),
    }
}

fn verifier(fetcher: Arc<FixtureFetcher>) -> IdentityVerifier {
    IdentityVerifier::new(config(Duration::ZERO), fetcher).expect("verifier config is valid")
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as i64
}

fn valid_claims() -> Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "1234567890",
        "email": "me@robokache.com",
        "iat": now(),
        "exp": now() + 3600,
    })
}

fn sign_with(private_key_pem: &[u8], kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(private_key_pem).expect("private key must parse"),
    )
    .expect("token encode should succeed")
}

fn sign(claims: &Value) -> String {
    sign_with(
        include_bytes!("fixtures/test_rsa_private.pem"),
        Some("test-kid"),
        claims,
    )
}

fn with_claim(key: &str, value: Value) -> Value {
    let mut claims = valid_claims();
    claims[key] = value;
    claims
}

#[tokio::test]
async fn verify_returns_email_principal() {
    let fetcher = FixtureFetcher::serving(jwks());
    let principal = verifier(fetcher.clone())
        .verify(&sign(&valid_claims()))
        .await
        .expect("token should verify");

    assert_eq!(principal, Principal::new("me@robokache.com"));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn verify_accepts_pem_key_maps() {
    let fetcher = FixtureFetcher::serving(include_bytes!("fixtures/test_pem_keys.json"));
    let principal = verifier(fetcher)
        .verify(&sign(&valid_claims()))
        .await
        .expect("token should verify against pem map");
    assert_eq!(principal.as_str(), "me@robokache.com");
}

#[tokio::test]
async fn verify_accepts_bare_issuer_spelling() {
    let claims = with_claim("iss", json!("accounts.google.com"));
    assert!(
        verifier(FixtureFetcher::serving(jwks()))
            .verify(&sign(&claims))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn verify_rejects_expired_tokens() {
    let claims = with_claim("exp", json!(now() - 600));
    let err = verifier(FixtureFetcher::serving(jwks()))
        .verify(&sign(&claims))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::TokenExpired);
    assert_eq!(err.code(), "ERR_AUTH_EXPIRED");
}

#[tokio::test]
async fn verify_rejects_tokens_not_yet_valid() {
    let claims = with_claim("nbf", json!(now() + 600));
    let err = verifier(FixtureFetcher::serving(jwks()))
        .verify(&sign(&claims))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::TokenNotYetValid);
}

#[tokio::test]
async fn verify_rejects_wrong_audience_and_issuer() {
    let v = verifier(FixtureFetcher::serving(jwks()));

    let claims = with_claim("aud", json!("someone-else"));
    assert_eq!(
        v.verify(&sign(&claims)).await.unwrap_err(),
        AuthError::InvalidAudience
    );

    let claims = with_claim("iss", json!("https://evil.example"));
    assert_eq!(
        v.verify(&sign(&claims)).await.unwrap_err(),
        AuthError::InvalidIssuer
    );
}

fn without_claim(key: &str) -> Value {
    let mut claims = valid_claims();
    claims
        .as_object_mut()
        .expect("claims are an object")
        .remove(key);
    claims
}

#[tokio::test]
async fn verify_requires_audience_and_issuer_claims() {
    let v = verifier(FixtureFetcher::serving(jwks()));

    assert_eq!(
        v.verify(&sign(&without_claim("aud"))).await.unwrap_err(),
        AuthError::InvalidAudience
    );
    assert_eq!(
        v.verify(&sign(&without_claim("iss"))).await.unwrap_err(),
        AuthError::InvalidIssuer
    );
    assert!(matches!(
        v.verify(&sign(&without_claim("exp"))).await.unwrap_err(),
        AuthError::MalformedToken(_)
    ));
}

#[tokio::test]
async fn verify_rejects_missing_email() {
    let mut claims = valid_claims();
    claims
        .as_object_mut()
        .expect("claims are an object")
        .remove("email");

    let v = verifier(FixtureFetcher::serving(jwks()));
    assert_eq!(
        v.verify(&sign(&claims)).await.unwrap_err(),
        AuthError::MissingIdentityClaim
    );

    let claims = with_claim("email", json!(42));
    assert_eq!(
        v.verify(&sign(&claims)).await.unwrap_err(),
        AuthError::MissingIdentityClaim
    );
}

#[tokio::test]
async fn verify_rejects_tokens_signed_by_another_key() {
    let token = sign_with(
        include_bytes!("fixtures/foreign_rsa_private.pem"),
        Some("test-kid"),
        &valid_claims(),
    );
    let err = verifier(FixtureFetcher::serving(jwks()))
        .verify(&token)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidSignature);
}

#[tokio::test]
async fn verify_rejects_unknown_and_missing_kid() {
    let v = verifier(FixtureFetcher::serving(jwks()));

    let token = sign_with(
        include_bytes!("fixtures/test_rsa_private.pem"),
        Some("rotated-away"),
        &valid_claims(),
    );
    assert_eq!(
        v.verify(&token).await.unwrap_err(),
        AuthError::UnknownSigningKey
    );

    let token = sign_with(
        include_bytes!("fixtures/test_rsa_private.pem"),
        None,
        &valid_claims(),
    );
    assert!(matches!(
        v.verify(&token).await.unwrap_err(),
        AuthError::MalformedToken(_)
    ));
}

#[tokio::test]
async fn verify_rejects_garbage_and_hmac_tokens() {
    let fetcher = FixtureFetcher::serving(jwks());
    let v = verifier(fetcher.clone());

    assert!(matches!(
        v.verify("not-a-jwt").await.unwrap_err(),
        AuthError::MalformedToken(_)
    ));

    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("test-kid".to_string());
    let hmac = encode(
        &header,
        &valid_claims(),
        &EncodingKey::from_secret(b"shared-secret"),
    )
    .expect("hmac token encodes");
    assert!(matches!(
        v.verify(&hmac).await.unwrap_err(),
        AuthError::MalformedToken(_)
    ));

    // Structural failures never reach the key endpoint.
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn key_fetch_failure_is_reported() {
    let err = verifier(FixtureFetcher::unreachable())
        .verify(&sign(&valid_claims()))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::KeyFetchFailed(_)));
    assert_eq!(err.code(), "ERR_AUTH_KEY_FETCH");
}

#[tokio::test]
async fn uncached_verifier_fetches_per_call() {
    let fetcher = FixtureFetcher::serving(jwks());
    let v = verifier(fetcher.clone());
    let token = sign(&valid_claims());

    v.verify(&token).await.expect("first verify");
    v.verify(&token).await.expect("second verify");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn cached_verifier_reuses_fresh_key_set() {
    let fetcher = FixtureFetcher::serving(jwks());
    let v = IdentityVerifier::new(config(Duration::from_secs(300)), fetcher.clone())
        .expect("verifier config is valid");
    let token = sign(&valid_claims());

    v.verify(&token).await.expect("first verify");
    v.verify(&token).await.expect("second verify");
    assert_eq!(fetcher.calls(), 1);

    // A kid missing from the cached set forces a refresh.
    let rotated = sign_with(
        include_bytes!("fixtures/test_rsa_private.pem"),
        Some("rotated-away"),
        &valid_claims(),
    );
    assert_eq!(
        v.verify(&rotated).await.unwrap_err(),
        AuthError::UnknownSigningKey
    );
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn unknown_kids_cannot_force_back_to_back_refreshes() {
    let fetcher = FixtureFetcher::serving(jwks());
    let mut cfg = config(Duration::from_secs(300));
    cfg.keys_min_refresh = Duration::from_secs(60);
    let v = IdentityVerifier::new(cfg, fetcher.clone()).expect("verifier config is valid");

    v.verify(&sign(&valid_claims())).await.expect("first verify");
    assert_eq!(fetcher.calls(), 1);

    for kid in ["rotated-1", "rotated-2", "rotated-3"] {
        let token = sign_with(
            include_bytes!("fixtures/test_rsa_private.pem"),
            Some(kid),
            &valid_claims(),
        );
        assert_eq!(
            v.verify(&token).await.unwrap_err(),
            AuthError::UnknownSigningKey
        );
    }
    assert_eq!(fetcher.calls(), 1);

    v.verify(&sign(&valid_claims())).await.expect("known kid still verifies");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn resolve_treats_missing_header_as_anonymous() {
    let fetcher = FixtureFetcher::serving(jwks());
    let v = verifier(fetcher.clone());

    assert_eq!(v.resolve(&HeaderMap::new()).await, Ok(None));
    assert_eq!(fetcher.calls(), 0);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", sign(&valid_claims()))
            .parse()
            .expect("authorization header must parse"),
    );
    assert_eq!(
        v.resolve(&headers).await,
        Ok(Some(Principal::new("me@robokache.com")))
    );

    headers.insert(
        header::AUTHORIZATION,
        "Token abc".parse().expect("header must parse"),
    );
    assert_eq!(
        v.resolve(&headers).await,
        Err(AuthError::MalformedCredential)
    );
}

#[test]
fn verifier_requires_audience_and_issuers() {
    let fetcher = FixtureFetcher::serving(jwks());

    let mut missing_audience = config(Duration::ZERO);
    missing_audience.audience = " ".to_string();
    assert!(matches!(
        IdentityVerifier::new(missing_audience, fetcher.clone()),
        Err(AuthError::InvalidConfig(_))
    ));

    let mut missing_issuers = config(Duration::ZERO);
    missing_issuers.issuers.clear();
    assert!(matches!(
        IdentityVerifier::new(missing_issuers, fetcher),
        Err(AuthError::InvalidConfig(_))
    ));
}
