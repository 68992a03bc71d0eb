//! Persisted document registry.
//!
//! The registry is a single JSON document (`data/metadata.json` by default)
//! holding one [`DocumentRecord`] per source document plus a schema version
//! and a `last_updated` timestamp. It is the only source of truth for "what
//! state is document X in".
//!
//! Every mutation is a read-modify-write of the whole file. Saves go through
//! a sibling temp file that is fsynced and renamed over the target, so a crash
//! leaves either the old or the new registry on disk, never a torn one.
//!
//! The registry does not lock. Callers must serialize access (one batch
//! process at a time).
//!
//! # File layout
//!
//! ```json
//! {
//!   "schema_version": "1.0.0",
//!   "last_updated": "2026-02-10T09:00:00Z",
//!   "documents": {
//!     "mirae_samsung_elec_20260210": { "status": "indexed", "...": "..." }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{DocumentRecord, FieldMap, HistoryEvent, LastError, PipelineStatus};

pub const SCHEMA_VERSION: &str = "1.0.0";

/// `major.minor` prefixes this build can read.
const SUPPORTED_SCHEMA_PREFIXES: &[&str] = &["1.0"];

const HASH_BUFFER_BYTES: usize = 8192;

/// In-memory image of the registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryData {
    pub schema_version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub documents: BTreeMap<String, DocumentRecord>,
}

impl RegistryData {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            last_updated: Utc::now(),
            documents: BTreeMap::new(),
        }
    }

    /// Id of the document currently holding `file_hash`, if any.
    pub fn find_document_by_hash(&self, file_hash: &str) -> Option<&str> {
        self.documents
            .iter()
            .find(|(_, doc)| doc.file_hash == file_hash)
            .map(|(id, _)| id.as_str())
    }

    fn document_mut(&mut self, document_id: &str) -> Result<&mut DocumentRecord> {
        self.documents
            .get_mut(document_id)
            .ok_or_else(|| Error::UnknownDocument(document_id.to_string()))
    }
}

/// Content hash of a file: `sha256:<hex>` over the full bytes.
pub fn compute_file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Document identity: the file name without its extension.
pub fn document_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn validate_schema(version: &str) -> Result<()> {
    let major_minor = version.split('.').take(2).collect::<Vec<_>>().join(".");
    if SUPPORTED_SCHEMA_PREFIXES.contains(&major_minor.as_str()) {
        Ok(())
    } else {
        Err(Error::UnsupportedSchema {
            version: version.to_string(),
        })
    }
}

/// Handle to the registry file. Cheap to clone; holds no open file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry, or an empty one if the file does not exist yet.
    pub fn load(&self) -> Result<RegistryData> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryData::empty());
            }
            Err(source) => {
                return Err(Error::RegistryIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        // Check the version before the shape: a newer layout should surface
        // as a schema error, not as a parse error.
        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| Error::RegistryFormat {
                path: self.path.clone(),
                source,
            })?;
        let version = raw
            .get("schema_version")
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0");
        validate_schema(version)?;

        serde_json::from_value(raw).map_err(|source| Error::RegistryFormat {
            path: self.path.clone(),
            source,
        })
    }

    /// Rewrite the whole registry file atomically, stamping `last_updated`.
    pub fn save(&self, data: &mut RegistryData) -> Result<()> {
        data.last_updated = Utc::now();
        let io_err = |source| Error::RegistryIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let json = serde_json::to_string_pretty(data).map_err(|source| Error::RegistryFormat {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Create an empty registry file if none exists. Existing files are
    /// validated but left untouched.
    pub fn init(&self) -> Result<bool> {
        if self.path.exists() {
            self.load()?;
            return Ok(false);
        }
        self.save(&mut RegistryData::empty())?;
        Ok(true)
    }

    fn modify<T>(&self, f: impl FnOnce(&mut RegistryData) -> Result<T>) -> Result<T> {
        let mut data = self.load()?;
        let out = f(&mut data)?;
        self.save(&mut data)?;
        Ok(out)
    }

    /// Register (or re-register) a source file and return its document id.
    ///
    /// Fails with [`Error::Duplicate`] without touching the file if another
    /// document already holds the same content hash. A changed hash or an
    /// explicit `reprocess_reason` forces the record back to `pending`.
    pub fn register_source_file(
        &self,
        path: &Path,
        file_hash: Option<&str>,
        reprocess_reason: Option<&str>,
    ) -> Result<String> {
        let document_id = document_id_for(path);
        let current_hash = match file_hash {
            Some(hash) => hash.to_string(),
            None => compute_file_hash(path).map_err(|e| Error::source_file(path, e))?,
        };
        let size = fs::metadata(path)
            .map_err(|e| Error::source_file(path, e))?
            .len();
        let source_file = file_name_of(path);

        self.modify(|data| {
            if let Some(existing) = data.find_document_by_hash(&current_hash) {
                if existing != document_id {
                    return Err(Error::Duplicate {
                        file: source_file.clone(),
                        existing: existing.to_string(),
                    });
                }
            }

            let mut record = data
                .documents
                .remove(&document_id)
                .unwrap_or_else(|| DocumentRecord::new(&document_id, &source_file, &current_hash, size));

            let changed_hash = record.file_hash != current_hash;
            record.document_id = document_id.clone();
            record.source_file = source_file.clone();
            record.file_hash = current_hash.clone();
            record.file_size_bytes = size;

            if let Some(reason) = reprocess_reason {
                record.status = PipelineStatus::Pending;
                record.reprocess_reason = Some(reason.to_string());
            } else if changed_hash {
                record.status = PipelineStatus::Pending;
                record.reprocess_reason = Some("hash_changed".to_string());
            }

            data.documents.insert(document_id.clone(), record);
            Ok(document_id.clone())
        })
    }

    pub fn update_status(&self, document_id: &str, status: PipelineStatus) -> Result<()> {
        self.modify(|data| {
            data.document_mut(document_id)?.status = status;
            Ok(())
        })
    }

    pub fn set_metadata(&self, document_id: &str, metadata: FieldMap) -> Result<()> {
        self.modify(|data| {
            data.document_mut(document_id)?.metadata = metadata;
            Ok(())
        })
    }

    pub fn mark_indexed(
        &self,
        document_id: &str,
        file_hash: &str,
        vector_count: Option<usize>,
    ) -> Result<()> {
        self.modify(|data| {
            let doc = data.document_mut(document_id)?;
            doc.status = PipelineStatus::Indexed;
            doc.indexed_file_hash = Some(file_hash.to_string());
            doc.reprocess_reason = None;
            doc.last_error = None;
            if vector_count.is_some() {
                doc.vector_count = vector_count;
            }
            Ok(())
        })
    }

    pub fn mark_failed(
        &self,
        document_id: &str,
        stage: PipelineStatus,
        error_message: &str,
        rolled_back: bool,
    ) -> Result<()> {
        self.modify(|data| {
            let doc = data.document_mut(document_id)?;
            record_failure(doc, stage, error_message, rolled_back);
            doc.status = PipelineStatus::Failed;
            Ok(())
        })
    }

    pub fn append_history(&self, document_id: &str, event: HistoryEvent) -> Result<()> {
        self.modify(|data| {
            data.document_mut(document_id)?.pipeline_history.push(event);
            Ok(())
        })
    }

    /// Deep copy of a record, taken before a risky transition.
    pub fn get_document_snapshot(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.load()?.documents.remove(document_id))
    }

    /// Restore a document to `snapshot` after a failed attempt.
    ///
    /// Without a snapshot this is [`mark_failed`](Self::mark_failed). With
    /// one, the whole record is replaced by the snapshot, its status is kept,
    /// and the failure is appended to the history with `rolled_back = true`.
    pub fn rollback_document(
        &self,
        document_id: &str,
        snapshot: Option<&DocumentRecord>,
        stage: PipelineStatus,
        error_message: &str,
    ) -> Result<()> {
        let Some(snapshot) = snapshot else {
            return self.mark_failed(document_id, stage, error_message, false);
        };

        self.modify(|data| {
            let mut restored = snapshot.clone();
            record_failure(&mut restored, stage, error_message, true);
            restored.status = snapshot.status;
            data.documents.insert(document_id.to_string(), restored);
            Ok(())
        })
    }
}

fn record_failure(
    doc: &mut DocumentRecord,
    stage: PipelineStatus,
    error_message: &str,
    rolled_back: bool,
) {
    let event = HistoryEvent::failure(stage, error_message, rolled_back);
    doc.last_error = Some(LastError {
        stage,
        timestamp: event.timestamp,
        message: error_message.to_string(),
    });
    doc.pipeline_history.push(event);
}
