use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod opaque_id;

use opaque_id::IdCodec;

/// Free-form document metadata. Opaque to the policy engine.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Document exposure level, ordered by ascending permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityTier {
    Invisible,
    Private,
    Shareable,
    Public,
}

impl VisibilityTier {
    pub const ALL: [VisibilityTier; 4] = [
        VisibilityTier::Invisible,
        VisibilityTier::Private,
        VisibilityTier::Shareable,
        VisibilityTier::Public,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VisibilityTier::Invisible => "invisible",
            VisibilityTier::Private => "private",
            VisibilityTier::Shareable => "shareable",
            VisibilityTier::Public => "public",
        }
    }

    /// Persisted integer form, `0..=3`.
    pub fn rank(self) -> i64 {
        match self {
            VisibilityTier::Invisible => 0,
            VisibilityTier::Private => 1,
            VisibilityTier::Shareable => 2,
            VisibilityTier::Public => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(VisibilityTier::Invisible),
            1 => Some(VisibilityTier::Private),
            2 => Some(VisibilityTier::Shareable),
            3 => Some(VisibilityTier::Public),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        VisibilityTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for VisibilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Accepts the lowercase name or the integer rank older clients send.
impl<'de> Deserialize<'de> for VisibilityTier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Rank(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Rank(rank) => VisibilityTier::from_rank(rank).ok_or_else(|| {
                serde::de::Error::custom(format!("visibility rank {} out of range 0..=3", rank))
            }),
            Raw::Name(name) => VisibilityTier::from_name(&name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown visibility `{}`", name))
            }),
        }
    }
}

/// A verified caller identity (the email claim of an identity token).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Internal sequential record identifier. Never serialized; see [`IdCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId(i64);

impl DocumentId {
    pub fn new(raw: i64) -> Option<Self> {
        (raw >= 0).then_some(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub owner: Principal,
    pub parent: Option<DocumentId>,
    pub visibility: VisibilityTier,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A document about to be inserted; the repository assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub owner: Principal,
    pub parent: Option<DocumentId>,
    pub visibility: VisibilityTier,
    pub metadata: Metadata,
}

/// Replacement values for the mutable fields of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFields {
    pub parent: Option<DocumentId>,
    pub visibility: VisibilityTier,
    pub metadata: Metadata,
}

impl Document {
    pub fn fields(&self) -> DocumentFields {
        DocumentFields {
            parent: self.parent,
            visibility: self.visibility,
            metadata: self.metadata.clone(),
        }
    }
}

/// Which part of the forest a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentFilter {
    #[default]
    Any,
    RootsOnly,
    ChildrenOnly,
}

impl ParentFilter {
    pub fn from_has_parent(has_parent: Option<bool>) -> Self {
        match has_parent {
            None => ParentFilter::Any,
            Some(false) => ParentFilter::RootsOnly,
            Some(true) => ParentFilter::ChildrenOnly,
        }
    }

    pub fn matches(self, parent: Option<DocumentId>) -> bool {
        match self {
            ParentFilter::Any => true,
            ParentFilter::RootsOnly => parent.is_none(),
            ParentFilter::ChildrenOnly => parent.is_some(),
        }
    }
}

/// External representation of a document. Carries opaque IDs only and never the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentView {
    pub id: String,
    pub parent: Option<String>,
    pub visibility: VisibilityTier,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned: Option<bool>,
}

impl DocumentView {
    pub fn render(document: &Document, codec: &IdCodec, owned: Option<bool>) -> Self {
        Self {
            id: codec.encode(document.id),
            parent: document.parent.map(|parent| codec.encode(parent)),
            visibility: document.visibility,
            metadata: document.metadata.clone(),
            created_at: document.created_at,
            owned,
        }
    }
}

/// Body of create and update requests. Absent fields fall back to defaults (create) or to the
/// current value (update).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentRequest {
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub visibility: Option<VisibilityTier>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedDocument {
    pub id: String,
}
