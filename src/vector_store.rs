//! Vector-store collaborator and the indexing step built on it.
//!
//! The runner never talks to a store directly. It goes through [`Indexer`],
//! which embeds chunks (when a provider is configured) and replaces a
//! document's records wholesale. Record ids are deterministic
//! (`{document_id}::chunk_{index}`), so re-indexing overwrites in place.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::{Chunk, FieldMap};

pub fn chunk_id(document_id: &str, chunk_index: usize) -> String {
    format!("{}::chunk_{}", document_id, chunk_index)
}

/// One stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub metadata: FieldMap,
    pub embedding: Option<Vec<f32>>,
}

impl VectorRecord {
    /// Record for `chunk`, filed under `document_id` whatever the chunk
    /// itself claims.
    pub fn from_chunk(document_id: &str, chunk: &Chunk, embedding: Option<Vec<f32>>) -> Self {
        let mut metadata = chunk.store_metadata();
        metadata.insert("document_id".into(), document_id.into());
        Self {
            id: chunk_id(document_id, chunk.chunk_index),
            document_id: document_id.to_string(),
            text: chunk.text.clone(),
            metadata,
            embedding,
        }
    }
}

/// Everything a store held for one document at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorSnapshot {
    pub document_id: String,
    pub records: Vec<VectorRecord>,
}

impl VectorSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create tables/collections if needed.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Insert or overwrite records by id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Remove every record of `document_id`.
    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Records of `document_id`, ordered by id.
    async fn snapshot(&self, document_id: &str) -> Result<VectorSnapshot>;

    async fn count(&self, document_id: &str) -> Result<usize> {
        Ok(self.snapshot(document_id).await?.records.len())
    }

    /// Make the store hold exactly `snapshot` for `document_id`.
    async fn restore(&self, document_id: &str, snapshot: &VectorSnapshot) -> Result<()> {
        self.delete_document(document_id).await?;
        if snapshot.is_empty() {
            return Ok(());
        }
        self.upsert(&snapshot.records).await
    }
}

/// Embeds and stores chunks for one document at a time.
pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Option<Arc<dyn Embedder>>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn snapshot(&self, document_id: &str) -> Result<VectorSnapshot> {
        self.store.snapshot(document_id).await
    }

    pub async fn restore(&self, document_id: &str, snapshot: &VectorSnapshot) -> Result<()> {
        self.store.restore(document_id, snapshot).await
    }

    /// Replace everything stored for `document_id` with `chunks`.
    ///
    /// Vectors are computed before the store is touched; the old records are
    /// then deleted and the new ones inserted. Returns the number stored.
    pub async fn replace_document(&self, document_id: &str, chunks: &[Chunk]) -> Result<usize> {
        let embeddings = self.embed_chunks(chunks).await?;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::from_chunk(document_id, chunk, embedding))
            .collect();

        self.store.delete_document(document_id).await?;
        if !records.is_empty() {
            self.store.upsert(&records).await?;
        }
        tracing::debug!(document_id, count = records.len(), "replaced document vectors");
        Ok(records.len())
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Option<Vec<f32>>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(vec![None; chunks.len()]);
        };

        let mut out = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(Error::external(
                    "embedder",
                    format!("expected {} vectors, got {}", texts.len(), vectors.len()),
                ));
            }
            for vector in vectors {
                if vector.len() != embedder.dims() {
                    return Err(Error::external(
                        "embedder",
                        format!(
                            "{} returned {} dims, expected {}",
                            embedder.model_name(),
                            vector.len(),
                            embedder.dims()
                        ),
                    ));
                }
                out.push(Some(vector));
            }
        }
        Ok(out)
    }
}
