use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};

use crate::AuthError;

#[derive(Debug, Clone)]
enum KeyMaterial {
    Jwk(Box<Jwk>),
    Pem(String),
}

/// Signing keys published by the identity provider, indexed by `kid`.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, KeyMaterial>,
}

impl KeySet {
    /// Accepts a JWKS document or a flat `{kid: PEM}` map.
    pub fn from_json(body: &[u8]) -> Result<Self, AuthError> {
        if let Ok(jwks) = serde_json::from_slice::<JwkSet>(body) {
            let keys = jwks
                .keys
                .into_iter()
                .filter_map(|jwk| {
                    let kid = jwk.common.key_id.clone()?;
                    Some((kid, KeyMaterial::Jwk(Box::new(jwk))))
                })
                .collect();
            return Ok(Self { keys });
        }

        let pems = serde_json::from_slice::<HashMap<String, String>>(body).map_err(|_| {
            AuthError::KeyFetchFailed("key set is neither a JWKS document nor a PEM map".to_string())
        })?;

        Ok(Self {
            keys: pems
                .into_iter()
                .map(|(kid, pem)| (kid, KeyMaterial::Pem(pem)))
                .collect(),
        })
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        match self.keys.get(kid) {
            None => Err(AuthError::UnknownSigningKey),
            Some(KeyMaterial::Jwk(jwk)) => {
                if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
                    return Err(AuthError::InvalidSigningKey);
                }
                DecodingKey::from_jwk(jwk).map_err(|_| AuthError::InvalidSigningKey)
            }
            Some(KeyMaterial::Pem(pem)) => {
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|_| AuthError::InvalidSigningKey)
            }
        }
    }
}

/// Retrieves the identity provider's current key set.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<KeySet, AuthError>;
}

#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    http: reqwest::Client,
}

impl HttpKeySetFetcher {
    pub fn new(timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                AuthError::InvalidConfig(format!("failed to initialize key set http client: {}", err))
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, url: &str) -> Result<KeySet, AuthError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AuthError::KeyFetchFailed("key set request timed out".to_string())
                } else {
                    AuthError::KeyFetchFailed("failed to reach key set endpoint".to_string())
                }
            })?
            .error_for_status()
            .map_err(|err| {
                AuthError::KeyFetchFailed(format!(
                    "key set endpoint returned {}",
                    err.status().map(|s| s.as_u16()).unwrap_or_default()
                ))
            })?;

        let body = response
            .bytes()
            .await
            .map_err(|_| AuthError::KeyFetchFailed("failed to read key set body".to_string()))?;

        KeySet::from_json(&body)
    }
}
