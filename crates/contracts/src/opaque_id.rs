//! Salted, reversible encoding between internal record IDs and the opaque strings callers see.
//!
//! The mapping is a pure function of the integer and the configured salt. Rotating the salt
//! invalidates every external ID issued before the rotation.

use std::sync::Arc;

use harsh::Harsh;

use crate::DocumentId;

const MAX_EXTERNAL_ID_SLACK: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub salt: String,
    pub min_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CodecError {}

/// Returned for any string that is not an ID issued under the configured salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidId;

impl InvalidId {
    pub const CODE: &'static str = "ERR_INVALID_ID";
}

impl std::fmt::Display for InvalidId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid document ID")
    }
}

impl std::error::Error for InvalidId {}

#[derive(Clone)]
pub struct IdCodec {
    harsh: Arc<Harsh>,
    max_len: usize,
}

impl std::fmt::Debug for IdCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCodec").finish_non_exhaustive()
    }
}

impl IdCodec {
    pub fn new(config: &CodecConfig) -> Result<Self, CodecError> {
        if config.salt.trim().is_empty() {
            return Err(CodecError {
                code: "ERR_INVALID_CONFIG",
                message: "id codec salt must be non-empty".to_string(),
            });
        }

        let harsh = Harsh::builder()
            .salt(config.salt.as_bytes())
            .length(config.min_length)
            .build()
            .map_err(|err| CodecError {
                code: "ERR_INVALID_CONFIG",
                message: format!("failed to initialize id codec: {}", err),
            })?;

        Ok(Self {
            harsh: Arc::new(harsh),
            max_len: config.min_length + MAX_EXTERNAL_ID_SLACK,
        })
    }

    pub fn encode(&self, id: DocumentId) -> String {
        // DocumentId is non-negative by construction.
        self.harsh.encode(&[id.get() as u64])
    }

    pub fn decode(&self, external: &str) -> Result<DocumentId, InvalidId> {
        if external.is_empty() || external.len() > self.max_len {
            return Err(InvalidId);
        }

        let values = self.harsh.decode(external).map_err(|_| InvalidId)?;
        let [value] = values.as_slice() else {
            return Err(InvalidId);
        };

        let raw = i64::try_from(*value).map_err(|_| InvalidId)?;
        let id = DocumentId::new(raw).ok_or(InvalidId)?;

        // Only the canonical spelling produced by `encode` is accepted.
        if self.encode(id) != external {
            return Err(InvalidId);
        }

        Ok(id)
    }
}
