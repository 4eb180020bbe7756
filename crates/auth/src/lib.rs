use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use robokache_contracts::Principal;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

pub mod keys;

pub use keys::{HttpKeySetFetcher, KeySet, KeySetFetcher};

/// Google's signing keys in JWKS form.
pub const DEFAULT_KEYS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

pub const DEFAULT_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub audience: String,
    pub issuers: Vec<String>,
    pub keys_url: String,
    pub keys_timeout: Duration,
    /// Zero disables caching: every verification fetches the key set.
    pub keys_cache_ttl: Duration,
    /// Floor between refreshes triggered by a `kid` missing from a still-fresh cached set.
    pub keys_min_refresh: Duration,
    pub clock_skew: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidConfig(String),
    MalformedCredential,
    MalformedToken(String),
    KeyFetchFailed(String),
    UnknownSigningKey,
    InvalidSigningKey,
    InvalidSignature,
    TokenExpired,
    TokenNotYetValid,
    InvalidAudience,
    InvalidIssuer,
    MissingIdentityClaim,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidConfig(_) => "ERR_INVALID_CONFIG",
            AuthError::MalformedCredential => "ERR_AUTH_MALFORMED_CREDENTIAL",
            AuthError::MalformedToken(_) => "ERR_AUTH_MALFORMED_TOKEN",
            AuthError::KeyFetchFailed(_) => "ERR_AUTH_KEY_FETCH",
            AuthError::UnknownSigningKey => "ERR_AUTH_UNKNOWN_KEY",
            AuthError::InvalidSigningKey => "ERR_AUTH_INVALID_KEY",
            AuthError::InvalidSignature => "ERR_AUTH_INVALID_SIGNATURE",
            AuthError::TokenExpired => "ERR_AUTH_EXPIRED",
            AuthError::TokenNotYetValid => "ERR_AUTH_NOT_YET_VALID",
            AuthError::InvalidAudience => "ERR_AUTH_INVALID_AUDIENCE",
            AuthError::InvalidIssuer => "ERR_AUTH_INVALID_ISSUER",
            AuthError::MissingIdentityClaim => "ERR_AUTH_MISSING_EMAIL",
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidConfig(message) => write!(f, "invalid verifier config: {}", message),
            AuthError::MalformedCredential => {
                write!(f, "Authorization must be a Bearer token")
            }
            AuthError::MalformedToken(message) => write!(f, "malformed token: {}", message),
            AuthError::KeyFetchFailed(message) => {
                write!(f, "failed to fetch signing keys: {}", message)
            }
            AuthError::UnknownSigningKey => write!(f, "token signed with an unknown key"),
            AuthError::InvalidSigningKey => write!(f, "signing key is not a usable RSA key"),
            AuthError::InvalidSignature => write!(f, "token signature is invalid"),
            AuthError::TokenExpired => write!(f, "token has expired"),
            AuthError::TokenNotYetValid => write!(f, "token is not valid yet"),
            AuthError::InvalidAudience => write!(f, "token was issued for another audience"),
            AuthError::InvalidIssuer => write!(f, "token was issued by an untrusted issuer"),
            AuthError::MissingIdentityClaim => write!(f, "token carries no email claim"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Claims consumed after signature and registered-claim validation.
#[derive(Debug, Deserialize)]
struct IdentityClaims {
    #[serde(default)]
    email: Option<Value>,
}

impl IdentityClaims {
    fn into_principal(self) -> Result<Principal, AuthError> {
        match self.email {
            Some(Value::String(email)) if !email.trim().is_empty() => {
                Ok(Principal::new(email.trim()))
            }
            _ => Err(AuthError::MissingIdentityClaim),
        }
    }
}

#[derive(Clone)]
pub struct IdentityVerifier {
    config: Arc<VerifierConfig>,
    fetcher: Arc<dyn KeySetFetcher>,
    cache: Arc<RwLock<KeySetCache>>,
}

#[derive(Debug, Default)]
struct KeySetCache {
    keys: Option<KeySet>,
    fetched_at: Option<Instant>,
}

impl KeySetCache {
    fn fresh_key(&self, kid: &str, ttl: Duration) -> Option<Result<DecodingKey, AuthError>> {
        let fresh = self.fetched_at.is_some_and(|t| t.elapsed() <= ttl);
        let keys = self.keys.as_ref()?;
        (fresh && keys.contains(kid)).then(|| keys.decoding_key(kid))
    }

    /// The cached set answers a `kid` miss while it is fresh and was fetched within `floor`.
    fn settled_miss(&self, kid: &str, ttl: Duration, floor: Duration) -> Option<AuthError> {
        let age = self.fetched_at?.elapsed();
        let keys = self.keys.as_ref()?;
        (age <= ttl && age < floor && !keys.contains(kid)).then_some(AuthError::UnknownSigningKey)
    }
}

impl IdentityVerifier {
    pub fn new(config: VerifierConfig, fetcher: Arc<dyn KeySetFetcher>) -> Result<Self, AuthError> {
        if config.audience.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "audience must be non-empty".to_string(),
            ));
        }

        if config.issuers.iter().all(|issuer| issuer.trim().is_empty()) {
            return Err(AuthError::InvalidConfig(
                "at least one trusted issuer is required".to_string(),
            ));
        }

        if config.keys_url.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "keys url must be non-empty".to_string(),
            ));
        }

        Ok(Self {
            config: Arc::new(config),
            fetcher,
            cache: Arc::new(RwLock::new(KeySetCache::default())),
        })
    }

    /// Resolves the request's caller. A missing `Authorization` header is an anonymous caller;
    /// any credential that is present must verify.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>, AuthError> {
        match bearer_token(headers)? {
            None => Ok(None),
            Some(token) => self.verify(token).await.map(Some),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let header = decode_header(token)
            .map_err(|_| AuthError::MalformedToken("invalid JWT header".to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::MalformedToken(
                "unsupported JWT alg (expected RS256)".to_string(),
            ));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::MalformedToken("JWT header missing kid".to_string()))?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&self.config.issuers);
        validation.set_audience(std::slice::from_ref(&self.config.audience));
        validation.leeway = self.config.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        let decoded = decode::<IdentityClaims>(token, &decoding_key, &validation)
            .map_err(|err| validation_error(err.kind()))?;

        decoded.claims.into_principal()
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let ttl = self.config.keys_cache_ttl;
        if ttl.is_zero() {
            return self
                .fetcher
                .fetch(&self.config.keys_url)
                .await?
                .decoding_key(kid);
        }

        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.fresh_key(kid, ttl) {
                return key;
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(key) = cache.fresh_key(kid, ttl) {
            return key;
        }
        if let Some(err) = cache.settled_miss(kid, ttl, self.config.keys_min_refresh) {
            tracing::debug!(kid, "auth.kid_miss_refresh_suppressed");
            return Err(err);
        }

        let keys = self.fetcher.fetch(&self.config.keys_url).await?;
        tracing::debug!(keys = keys.len(), "auth.key_set_refreshed");
        cache.keys = Some(keys);
        cache.fetched_at = Some(Instant::now());

        match cache.keys.as_ref() {
            Some(keys) => keys.decoding_key(kid),
            None => Err(AuthError::UnknownSigningKey),
        }
    }
}

fn validation_error(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => AuthError::InvalidSigningKey,
        ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
            "aud" => AuthError::InvalidAudience,
            "iss" => AuthError::InvalidIssuer,
            other => AuthError::MalformedToken(format!("required claim `{}` is missing", other)),
        },
        _ => AuthError::MalformedToken("JWT could not be decoded".to_string()),
    }
}

/// `Ok(None)` when no `Authorization` header is present.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let authz = value.to_str().map_err(|_| AuthError::MalformedCredential)?;
    let token = authz
        .strip_prefix("Bearer")
        .and_then(|rest| {
            let mut chars = rest.chars();
            chars
                .next()
                .filter(char::is_ascii_whitespace)
                .map(|_| chars.as_str())
        })
        .ok_or(AuthError::MalformedCredential)?;

    let in_alphabet = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if token.is_empty() || !token.chars().all(in_alphabet) {
        return Err(AuthError::MalformedCredential);
    }

    Ok(Some(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(authz: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, authz.parse().unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_optional() {
        assert_eq!(bearer_token(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn bearer_token_extracts_jwt_alphabet() {
        let h = headers("Bearer abc.DEF-ghi_123");
        assert_eq!(bearer_token(&h), Ok(Some("abc.DEF-ghi_123")));
    }

    #[test]
    fn bearer_token_rejects_malformed_credentials() {
        for authz in [
            "Basic dXNlcjpwYXNz",
            "Bearer",
            "Bearer ",
            "Bearerabc",
            "Bearer abc def",
            "Bearer abc+/=",
            "bearer abc",
        ] {
            assert_eq!(
                bearer_token(&headers(authz)),
                Err(AuthError::MalformedCredential),
                "authz {:?}",
                authz
            );
        }
    }

    #[test]
    fn identity_claim_must_be_a_non_empty_string() {
        let claims = |value: Value| IdentityClaims { email: Some(value) }.into_principal();

        assert_eq!(
            claims(Value::String("me@example.com".to_string())),
            Ok(Principal::new("me@example.com"))
        );
        assert_eq!(
            claims(Value::String("  ".to_string())),
            Err(AuthError::MissingIdentityClaim)
        );
        assert_eq!(claims(Value::Bool(true)), Err(AuthError::MissingIdentityClaim));
        assert_eq!(
            IdentityClaims { email: None }.into_principal(),
            Err(AuthError::MissingIdentityClaim)
        );
    }

    #[test]
    fn every_error_has_an_auth_code() {
        let errors = [
            AuthError::MalformedCredential,
            AuthError::MalformedToken(String::new()),
            AuthError::KeyFetchFailed(String::new()),
            AuthError::UnknownSigningKey,
            AuthError::InvalidSigningKey,
            AuthError::InvalidSignature,
            AuthError::TokenExpired,
            AuthError::TokenNotYetValid,
            AuthError::InvalidAudience,
            AuthError::InvalidIssuer,
            AuthError::MissingIdentityClaim,
        ];
        for err in errors {
            assert!(err.code().starts_with("ERR_AUTH_"), "{}", err.code());
        }
    }
}
