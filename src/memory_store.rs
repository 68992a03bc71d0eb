//! In-memory vector store.
//!
//! Keeps records in a `BTreeMap` keyed by chunk id. Nothing is persisted;
//! used by tests and by `vector_store.backend = "memory"`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::vector_store::{VectorRecord, VectorSnapshot, VectorStore};

#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    records: Mutex<BTreeMap<String, VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all documents.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, VectorRecord>> {
        // A poisoned map is still structurally valid.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut map = self.lock();
        for record in records {
            map.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.lock().retain(|_, r| r.document_id != document_id);
        Ok(())
    }

    async fn snapshot(&self, document_id: &str) -> Result<VectorSnapshot> {
        let records = self
            .lock()
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect();
        Ok(VectorSnapshot {
            document_id: document_id.to_string(),
            records,
        })
    }
}
