//! SQLite-backed vector store.
//!
//! One `vectors` table keyed by `(collection, id)`. Embeddings are stored as
//! little-endian f32 BLOBs (see [`vec_to_blob`]); metadata as a JSON string.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::FieldMap;
use crate::vector_store::{VectorRecord, VectorSnapshot, VectorStore};

const SERVICE: &str = "vector store";

fn store_err(e: sqlx::Error) -> Error {
    Error::external(SERVICE, e.to_string())
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: &Path, collection: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::external(SERVICE, format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(store_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        let store = Self {
            pool,
            collection: collection.to_string(),
        };
        store.init().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                embedding BLOB,
                dims INTEGER,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(collection, document_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for record in records {
            let metadata_json = serde_json::to_string(&record.metadata)
                .map_err(|e| Error::external(SERVICE, e.to_string()))?;
            let blob = record.embedding.as_deref().map(vec_to_blob);
            let dims = record.embedding.as_ref().map(|v| v.len() as i64);

            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, document_id, text, metadata_json, embedding, dims)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    dims = excluded.dims
                "#,
            )
            .bind(&self.collection)
            .bind(&record.id)
            .bind(&record.document_id)
            .bind(&record.text)
            .bind(metadata_json)
            .bind(blob)
            .bind(dims)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE collection = ? AND document_id = ?")
            .bind(&self.collection)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn snapshot(&self, document_id: &str) -> Result<VectorSnapshot> {
        let rows = sqlx::query(
            "SELECT id, document_id, text, metadata_json, embedding FROM vectors \
             WHERE collection = ? AND document_id = ? ORDER BY id",
        )
        .bind(&self.collection)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let metadata_json: String = row.get("metadata_json");
            let metadata: FieldMap = serde_json::from_str(&metadata_json).map_err(|e| {
                Error::external(SERVICE, format!("corrupt metadata for {}: {}", id, e))
            })?;
            let blob: Option<Vec<u8>> = row.get("embedding");
            records.push(VectorRecord {
                id,
                document_id: row.get("document_id"),
                text: row.get("text"),
                metadata,
                embedding: blob.map(|b| blob_to_vec(&b)),
            });
        }

        Ok(VectorSnapshot {
            document_id: document_id.to_string(),
            records,
        })
    }

    async fn count(&self, document_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vectors WHERE collection = ? AND document_id = ?",
        )
        .bind(&self.collection)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(n as usize)
    }
}
