use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use robokache_contracts::{
    Document, DocumentFields, DocumentId, NewDocument, ParentFilter, Principal, VisibilityTier,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{DocumentRepository, DocumentTransaction, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    last_id: i64,
    documents: BTreeMap<DocumentId, Document>,
}

impl MemoryState {
    fn children(&self, parent: DocumentId) -> Vec<Document> {
        self.documents
            .values()
            .filter(|document| document.parent == Some(parent))
            .cloned()
            .collect()
    }

    fn check_parent(&self, parent: Option<DocumentId>) -> Result<(), StoreError> {
        match parent {
            Some(parent) if !self.documents.contains_key(&parent) => Err(StoreError::Constraint(
                format!("parent {} does not exist", parent.get()),
            )),
            _ => Ok(()),
        }
    }
}

/// Process-local repository for tests and ephemeral deployments. Transactions work on a copy
/// of the state and hold the lock until commit or drop.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.state.lock().await.documents.get(&id).cloned())
    }

    async fn find_by_owner_or_visibility(
        &self,
        principal: Option<&Principal>,
        min_visibility: VisibilityTier,
        parent: ParentFilter,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .values()
            .filter(|document| {
                principal.is_some_and(|p| *p == document.owner)
                    || document.visibility >= min_visibility
            })
            .filter(|document| parent.matches(document.parent))
            .cloned()
            .collect())
    }

    async fn find_children(&self, parent: DocumentId) -> Result<Vec<Document>, StoreError> {
        Ok(self.state.lock().await.children(parent))
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl DocumentTransaction for MemoryTransaction {
    async fn find_by_id(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.working.documents.get(&id).cloned())
    }

    async fn find_children(&mut self, parent: DocumentId) -> Result<Vec<Document>, StoreError> {
        Ok(self.working.children(parent))
    }

    async fn insert(&mut self, document: NewDocument) -> Result<DocumentId, StoreError> {
        self.working.check_parent(document.parent)?;

        let raw = self.working.last_id + 1;
        let id = DocumentId::new(raw)
            .ok_or_else(|| StoreError::Corrupt(format!("id sequence produced {}", raw)))?;
        self.working.last_id = raw;
        self.working.documents.insert(
            id,
            Document {
                id,
                owner: document.owner,
                parent: document.parent,
                visibility: document.visibility,
                metadata: document.metadata,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update(&mut self, id: DocumentId, fields: &DocumentFields) -> Result<u64, StoreError> {
        self.working.check_parent(fields.parent)?;

        let Some(document) = self.working.documents.get_mut(&id) else {
            return Ok(0);
        };
        document.parent = fields.parent;
        document.visibility = fields.visibility;
        document.metadata = fields.metadata.clone();
        Ok(1)
    }

    async fn delete(&mut self, id: DocumentId) -> Result<u64, StoreError> {
        if self.working.documents.remove(&id).is_none() {
            return Ok(0);
        }
        for child in self.working.documents.values_mut() {
            if child.parent == Some(id) {
                child.parent = None;
            }
        }
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
