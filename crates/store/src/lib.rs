use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use robokache_contracts::{
    Document, DocumentFields, DocumentId, NewDocument, ParentFilter, Principal, VisibilityTier,
};

mod blob;
mod memory;
mod sqlite;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use memory::MemoryRepository;
pub use sqlite::{SqliteRepository, migrate};

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Io(std::io::Error),
    Constraint(String),
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Timeout => "ERR_STORE_TIMEOUT",
            StoreError::Sqlx(_) => "ERR_STORE_SQL",
            StoreError::Io(_) => "ERR_STORE_IO",
            StoreError::Constraint(_) => "ERR_STORE_CONSTRAINT",
            StoreError::Corrupt(_) => "ERR_STORE_CORRUPT",
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Io(err) => write!(f, "blob io error: {}", err),
            StoreError::Constraint(message) => write!(f, "constraint violated: {}", message),
            StoreError::Corrupt(message) => write!(f, "corrupt record: {}", message),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlx(err) => Some(err),
            StoreError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::Io(value)
    }
}

/// Document persistence. Reads outside a transaction see committed state only.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Documents owned by `principal` or at least `min_visibility`, ordered by id.
    async fn find_by_owner_or_visibility(
        &self,
        principal: Option<&Principal>,
        min_visibility: VisibilityTier,
        parent: ParentFilter,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_children(&self, parent: DocumentId) -> Result<Vec<Document>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert(&self, document: NewDocument) -> Result<DocumentId, StoreError> {
        let mut tx = self.begin().await?;
        let id = tx.insert(document).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update(&self, id: DocumentId, fields: &DocumentFields) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let affected = tx.update(id, fields).await?;
        tx.commit().await?;
        Ok(affected)
    }

    async fn delete(&self, id: DocumentId) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let affected = tx.delete(id).await?;
        tx.commit().await?;
        Ok(affected)
    }
}

/// A unit of work. Dropping without `commit` discards every change.
#[async_trait]
pub trait DocumentTransaction: Send {
    async fn find_by_id(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn find_children(&mut self, parent: DocumentId) -> Result<Vec<Document>, StoreError>;

    async fn insert(&mut self, document: NewDocument) -> Result<DocumentId, StoreError>;

    async fn update(&mut self, id: DocumentId, fields: &DocumentFields) -> Result<u64, StoreError>;

    /// Children of a deleted document become roots.
    async fn delete(&mut self, id: DocumentId) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// `start` followed by each of its ancestors up to the root.
    async fn ancestry(&mut self, start: DocumentId) -> Result<Vec<DocumentId>, StoreError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(start);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(StoreError::Corrupt(format!(
                    "document {} is part of a parent cycle",
                    id.get()
                )));
            }
            chain.push(id);
            cursor = match self.find_by_id(id).await? {
                Some(document) => document.parent,
                None => None,
            };
        }

        Ok(chain)
    }
}

/// Byte payload attached to each document.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Empty when nothing was ever written.
    async fn read(&self, id: DocumentId) -> Result<Bytes, StoreError>;

    async fn write(&self, id: DocumentId, data: Bytes) -> Result<(), StoreError>;

    /// Deleting an absent payload succeeds.
    async fn delete(&self, id: DocumentId) -> Result<(), StoreError>;
}
