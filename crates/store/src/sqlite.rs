use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use robokache_contracts::{
    Document, DocumentFields, DocumentId, Metadata, NewDocument, ParentFilter, Principal,
    VisibilityTier,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{DocumentRepository, DocumentTransaction, StoreError};

const SELECT_DOCUMENT: &str =
    "SELECT id, parent, owner, visibility, metadata, created_at FROM document";

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: i64,
    parent: Option<i64>,
    owner: String,
    visibility: i64,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let id = DocumentId::new(row.id)
            .ok_or_else(|| StoreError::Corrupt(format!("negative document id {}", row.id)))?;
        let parent = row
            .parent
            .map(|parent| {
                DocumentId::new(parent).ok_or_else(|| {
                    StoreError::Corrupt(format!("negative parent id on document {}", row.id))
                })
            })
            .transpose()?;
        let visibility = VisibilityTier::from_rank(row.visibility).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "visibility {} out of range on document {}",
                row.visibility, row.id
            ))
        })?;
        let metadata = serde_json::from_str::<Metadata>(&row.metadata).map_err(|err| {
            StoreError::Corrupt(format!("metadata of document {}: {}", row.id, err))
        })?;

        Ok(Document {
            id,
            owner: Principal::new(row.owner),
            parent,
            visibility,
            metadata,
            created_at: row.created_at,
        })
    }
}

fn into_documents(rows: Vec<DocumentRow>) -> Result<Vec<Document>, StoreError> {
    rows.into_iter().map(Document::try_from).collect()
}

fn metadata_json(metadata: &Metadata) -> Result<String, StoreError> {
    serde_json::to_string(metadata)
        .map_err(|err| StoreError::Corrupt(format!("unserializable metadata: {}", err)))
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    Ok(tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout)??)
}

/// SQLite-backed repository. Writers are serialized through one gate so a transaction's
/// reads stay valid until it commits.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
    op_timeout: Duration,
    write_gate: Arc<Mutex<()>>,
}

impl SqliteRepository {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(op_timeout);

        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            SqlitePoolOptions::new().max_connections(8).connect_with(options),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self::from_pool(pool, op_timeout))
    }

    pub async fn connect_and_migrate(db_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let repo = Self::connect(db_url, op_timeout).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    pub fn from_pool(pool: SqlitePool, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Sqlx(err.into()))?;
    Ok(())
}

#[async_trait]
impl DocumentRepository for SqliteRepository {
    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let sql = format!("{SELECT_DOCUMENT} WHERE id = ?1");
        let row = bounded(
            self.op_timeout,
            sqlx::query_as::<_, DocumentRow>(&sql)
                .bind(id.get())
                .fetch_optional(&self.pool),
        )
        .await?;
        row.map(Document::try_from).transpose()
    }

    async fn find_by_owner_or_visibility(
        &self,
        principal: Option<&Principal>,
        min_visibility: VisibilityTier,
        parent: ParentFilter,
    ) -> Result<Vec<Document>, StoreError> {
        let parent_clause = match parent {
            ParentFilter::Any => "",
            ParentFilter::RootsOnly => " AND parent IS NULL",
            ParentFilter::ChildrenOnly => " AND parent IS NOT NULL",
        };
        let sql = format!(
            "{SELECT_DOCUMENT} WHERE (owner = ?1 OR visibility >= ?2){parent_clause} ORDER BY id"
        );
        let rows = bounded(
            self.op_timeout,
            sqlx::query_as::<_, DocumentRow>(&sql)
                .bind(principal.map(Principal::as_str))
                .bind(min_visibility.rank())
                .fetch_all(&self.pool),
        )
        .await?;
        into_documents(rows)
    }

    async fn find_children(&self, parent: DocumentId) -> Result<Vec<Document>, StoreError> {
        let sql = format!("{SELECT_DOCUMENT} WHERE parent = ?1 ORDER BY id");
        let rows = bounded(
            self.op_timeout,
            sqlx::query_as::<_, DocumentRow>(&sql)
                .bind(parent.get())
                .fetch_all(&self.pool),
        )
        .await?;
        into_documents(rows)
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        let gate = tokio::time::timeout(self.op_timeout, self.write_gate.clone().lock_owned())
            .await
            .map_err(|_| StoreError::Timeout)?;
        let tx = bounded(self.op_timeout, self.pool.begin()).await?;
        Ok(Box::new(SqliteTransaction {
            tx,
            op_timeout: self.op_timeout,
            _gate: gate,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        bounded(
            self.op_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    op_timeout: Duration,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl DocumentTransaction for SqliteTransaction {
    async fn find_by_id(&mut self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let sql = format!("{SELECT_DOCUMENT} WHERE id = ?1");
        let row = bounded(
            self.op_timeout,
            sqlx::query_as::<_, DocumentRow>(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx),
        )
        .await?;
        row.map(Document::try_from).transpose()
    }

    async fn find_children(&mut self, parent: DocumentId) -> Result<Vec<Document>, StoreError> {
        let sql = format!("{SELECT_DOCUMENT} WHERE parent = ?1 ORDER BY id");
        let rows = bounded(
            self.op_timeout,
            sqlx::query_as::<_, DocumentRow>(&sql)
                .bind(parent.get())
                .fetch_all(&mut *self.tx),
        )
        .await?;
        into_documents(rows)
    }

    async fn insert(&mut self, document: NewDocument) -> Result<DocumentId, StoreError> {
        let metadata = metadata_json(&document.metadata)?;
        let id: i64 = bounded(
            self.op_timeout,
            sqlx::query_scalar(
                "INSERT INTO document (parent, owner, visibility, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            )
            .bind(document.parent.map(DocumentId::get))
            .bind(document.owner.as_str())
            .bind(document.visibility.rank())
            .bind(&metadata)
            .bind(Utc::now())
            .fetch_one(&mut *self.tx),
        )
        .await?;

        DocumentId::new(id)
            .ok_or_else(|| StoreError::Corrupt(format!("database assigned negative id {}", id)))
    }

    async fn update(&mut self, id: DocumentId, fields: &DocumentFields) -> Result<u64, StoreError> {
        let metadata = metadata_json(&fields.metadata)?;
        let result = bounded(
            self.op_timeout,
            sqlx::query(
                "UPDATE document SET parent = ?1, visibility = ?2, metadata = ?3 WHERE id = ?4",
            )
            .bind(fields.parent.map(DocumentId::get))
            .bind(fields.visibility.rank())
            .bind(&metadata)
            .bind(id.get())
            .execute(&mut *self.tx),
        )
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&mut self, id: DocumentId) -> Result<u64, StoreError> {
        // ON DELETE SET NULL turns the children into roots.
        let result = bounded(
            self.op_timeout,
            sqlx::query("DELETE FROM document WHERE id = ?1")
                .bind(id.get())
                .execute(&mut *self.tx),
        )
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let SqliteTransaction {
            tx,
            op_timeout,
            _gate,
        } = *self;
        bounded(op_timeout, tx.commit()).await
    }
}
