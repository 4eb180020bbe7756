use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use robokache_contracts::DocumentId;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::{BlobStore, StoreError};

/// One file per document under `<data_dir>/files`, named by internal id.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = data_dir.as_ref().join("files");
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, id: DocumentId) -> PathBuf {
        self.root.join(id.get().to_string())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, id: DocumentId) -> Result<Bytes, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, id: DocumentId, data: Bytes) -> Result<(), StoreError> {
        // Readers see either the old payload or the new one, never a partial write.
        let tmp = self.root.join(format!(".{}.{}.tmp", id.get(), Ulid::new()));
        if let Err(err) = tokio::fs::write(&tmp, &data).await {
            discard_temp(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp, self.path_for(id)).await {
            discard_temp(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, id: DocumentId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn discard_temp(tmp: &Path) {
    match tokio::fs::remove_file(tmp).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %tmp.display(), error = %err, "store.blob_temp_leaked");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<DocumentId, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: DocumentId) -> bool {
        self.blobs.read().await.contains_key(&id)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, id: DocumentId) -> Result<Bytes, StoreError> {
        Ok(self.blobs.read().await.get(&id).cloned().unwrap_or_default())
    }

    async fn write(&self, id: DocumentId, data: Bytes) -> Result<(), StoreError> {
        self.blobs.write().await.insert(id, data);
        Ok(())
    }

    async fn delete(&self, id: DocumentId) -> Result<(), StoreError> {
        self.blobs.write().await.remove(&id);
        Ok(())
    }
}
