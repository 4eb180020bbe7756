//! Document operations. Each mutation runs its checks and its writes inside one repository
//! transaction so a concurrent change to the parent cannot slip in between.

use std::sync::Arc;

use bytes::Bytes;
use robokache_contracts::{
    Document, DocumentFields, DocumentId, Metadata, NewDocument, ParentFilter, Principal,
    VisibilityTier,
};
use robokache_policy::{
    LISTING_BAR, ParentCandidate, PolicyError, authorize_read, authorize_write, can_create,
    filter_listable, filter_viewable, validate_children_visibility, validate_no_cycle,
    validate_parent_assignment,
};
use robokache_store::{BlobStore, DocumentRepository, DocumentTransaction, StoreError};

#[derive(Debug)]
pub enum ServiceError {
    Policy(PolicyError),
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Policy(err) => write!(f, "{}", err),
            ServiceError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<PolicyError> for ServiceError {
    fn from(value: PolicyError) -> Self {
        ServiceError::Policy(value)
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        ServiceError::Store(value)
    }
}

/// Field values supplied by a create or update request, with IDs already decoded.
#[derive(Debug, Clone, Default)]
pub struct DocumentChanges {
    pub parent: Option<DocumentId>,
    pub visibility: Option<VisibilityTier>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone)]
pub struct DocumentService {
    repo: Arc<dyn DocumentRepository>,
    blobs: Arc<dyn BlobStore>,
}

impl DocumentService {
    pub fn new(repo: Arc<dyn DocumentRepository>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { repo, blobs }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.repo.ping().await
    }

    pub async fn list(
        &self,
        principal: Option<&Principal>,
        filter: ParentFilter,
    ) -> Result<Vec<Document>, ServiceError> {
        let candidates = self
            .repo
            .find_by_owner_or_visibility(principal, LISTING_BAR, filter)
            .await?;
        Ok(filter_listable(principal, candidates))
    }

    pub async fn get(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
    ) -> Result<Document, ServiceError> {
        let document = self.repo.find_by_id(id).await?;
        Ok(authorize_read(principal, document)?)
    }

    pub async fn children(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
    ) -> Result<Vec<Document>, ServiceError> {
        let parent = self.get(principal, id).await?;
        let children = self.repo.find_children(parent.id).await?;
        Ok(filter_viewable(principal, children))
    }

    /// Visibility defaults to the parent's when a parent is given, else private.
    pub async fn create(
        &self,
        principal: Option<&Principal>,
        changes: DocumentChanges,
    ) -> Result<DocumentId, ServiceError> {
        let owner = can_create(principal)?.clone();

        let mut tx = self.repo.begin().await?;
        let parent = match changes.parent {
            Some(parent) => tx.find_by_id(parent).await?,
            None => None,
        };

        let visibility = changes
            .visibility
            .or(parent.as_ref().map(|p| p.visibility))
            .unwrap_or(VisibilityTier::Private);

        validate_parent_assignment(
            &owner,
            visibility,
            ParentCandidate::from_lookup(changes.parent.is_some(), parent.as_ref()),
        )?;

        let id = tx
            .insert(NewDocument {
                owner,
                parent: changes.parent,
                visibility,
                metadata: changes.metadata.unwrap_or_default(),
            })
            .await?;
        tx.commit().await?;

        tracing::info!(document = id.get(), "documents.created");
        Ok(id)
    }

    /// Creates a child of `parent` with the parent's visibility and `data` as its payload.
    pub async fn create_child_with_data(
        &self,
        principal: Option<&Principal>,
        parent: DocumentId,
        data: Bytes,
    ) -> Result<DocumentId, ServiceError> {
        let owner = can_create(principal)?.clone();

        let mut tx = self.repo.begin().await?;
        let parent = authorize_read(Some(&owner), tx.find_by_id(parent).await?)?;
        validate_parent_assignment(
            &owner,
            parent.visibility,
            ParentCandidate::Found(&parent),
        )?;

        let id = tx
            .insert(NewDocument {
                owner,
                parent: Some(parent.id),
                visibility: parent.visibility,
                metadata: Metadata::new(),
            })
            .await?;

        self.blobs.write(id, data).await?;
        if let Err(err) = tx.commit().await {
            if let Err(cleanup) = self.blobs.delete(id).await {
                tracing::warn!(document = id.get(), error = %cleanup, "documents.orphan_blob");
            }
            return Err(err.into());
        }

        tracing::info!(document = id.get(), parent = parent.id.get(), "documents.created");
        Ok(id)
    }

    /// Absent fields keep their current value. Returns the stored document.
    pub async fn update(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
        changes: DocumentChanges,
    ) -> Result<Document, ServiceError> {
        let mut tx = self.repo.begin().await?;
        let existing = authorize_write(principal, tx.find_by_id(id).await?)?;

        let fields = DocumentFields {
            parent: changes.parent.or(existing.parent),
            visibility: changes.visibility.unwrap_or(existing.visibility),
            metadata: changes.metadata.unwrap_or_else(|| existing.metadata.clone()),
        };

        let parent = match fields.parent {
            Some(parent) => {
                let ancestry = tx.ancestry(parent).await?;
                validate_no_cycle(id, &ancestry)?;
                tx.find_by_id(parent).await?
            }
            None => None,
        };
        validate_parent_assignment(
            &existing.owner,
            fields.visibility,
            ParentCandidate::from_lookup(fields.parent.is_some(), parent.as_ref()),
        )?;

        let children = tx.find_children(id).await?;
        validate_children_visibility(fields.visibility, &children)?;

        if tx.update(id, &fields).await? == 0 {
            return Err(PolicyError::NotFound.into());
        }
        tx.commit().await?;

        tracing::info!(document = id.get(), "documents.updated");
        Ok(Document {
            parent: fields.parent,
            visibility: fields.visibility,
            metadata: fields.metadata,
            ..existing
        })
    }

    /// Removes the document and its payload. Children become roots.
    pub async fn delete(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
    ) -> Result<(), ServiceError> {
        let mut tx = self.repo.begin().await?;
        authorize_write(principal, tx.find_by_id(id).await?)?;

        if tx.delete(id).await? == 0 {
            return Err(PolicyError::NotFound.into());
        }
        tx.commit().await?;

        // The row is gone; a payload left behind is unreachable, not an error for the caller.
        if let Err(err) = self.blobs.delete(id).await {
            tracing::warn!(document = id.get(), error = %err, "documents.orphan_blob");
        }

        tracing::info!(document = id.get(), "documents.deleted");
        Ok(())
    }

    pub async fn read_data(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
    ) -> Result<Bytes, ServiceError> {
        let document = self.get(principal, id).await?;
        Ok(self.blobs.read(document.id).await?)
    }

    pub async fn write_data(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
        data: Bytes,
    ) -> Result<(), ServiceError> {
        let tx = self.begin_owned(principal, id).await?;
        self.blobs.write(id, data).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Holds the transaction open so the document cannot be deleted mid-write.
    async fn begin_owned(
        &self,
        principal: Option<&Principal>,
        id: DocumentId,
    ) -> Result<Box<dyn DocumentTransaction>, ServiceError> {
        let mut tx = self.repo.begin().await?;
        authorize_write(principal, tx.find_by_id(id).await?)?;
        Ok(tx)
    }
}
