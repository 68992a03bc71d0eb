//! Core data models used throughout the ingestion pipeline.
//!
//! [`DocumentRecord`] is the persisted unit of the registry. The remaining
//! types ([`ProcessingPlan`], [`Chunk`], [`ParseResult`]) are ephemeral and
//! only live for the duration of a batch run.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque field map attached to documents and chunks.
pub type FieldMap = Map<String, Value>;

/// Position of a document in the parse → chunk → index pipeline.
///
/// History events reuse these names for their `stage` field: successful
/// events carry the completed state (`parsed`, `chunked`, `indexed`), failed
/// events carry the state that was active when the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Parsing,
    Parsed,
    Chunking,
    Chunked,
    Indexing,
    Indexed,
    Failed,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 8] = [
        PipelineStatus::Pending,
        PipelineStatus::Parsing,
        PipelineStatus::Parsed,
        PipelineStatus::Chunking,
        PipelineStatus::Chunked,
        PipelineStatus::Indexing,
        PipelineStatus::Indexed,
        PipelineStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Parsing => "parsing",
            PipelineStatus::Parsed => "parsed",
            PipelineStatus::Chunking => "chunking",
            PipelineStatus::Chunked => "chunked",
            PipelineStatus::Indexing => "indexing",
            PipelineStatus::Indexed => "indexed",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a document's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub stage: PipelineStatus,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<bool>,
}

impl HistoryEvent {
    pub fn success(stage: PipelineStatus) -> Self {
        Self {
            stage,
            timestamp: Utc::now(),
            success: true,
            error_message: None,
            chunk_count: None,
            vector_count: None,
            rolled_back: None,
        }
    }

    pub fn failure(stage: PipelineStatus, error_message: &str, rolled_back: bool) -> Self {
        Self {
            stage,
            timestamp: Utc::now(),
            success: false,
            error_message: Some(error_message.to_string()),
            chunk_count: None,
            vector_count: None,
            rolled_back: Some(rolled_back),
        }
    }
}

/// Most recent failure of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub stage: PipelineStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Persisted processing record for one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source_file: String,
    /// `sha256:<hex>` of the full file bytes.
    pub file_hash: String,
    pub file_size_bytes: u64,
    pub added_at: DateTime<Utc>,
    pub status: PipelineStatus,
    /// Hash of the version whose vectors are currently indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_count: Option<usize>,
    #[serde(default)]
    pub metadata: FieldMap,
    #[serde(default)]
    pub pipeline_history: Vec<HistoryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocess_reason: Option<String>,
}

impl DocumentRecord {
    /// A record that has not been seen before: `pending`, no history.
    pub fn new(document_id: &str, source_file: &str, file_hash: &str, size: u64) -> Self {
        Self {
            document_id: document_id.to_string(),
            source_file: source_file.to_string(),
            file_hash: file_hash.to_string(),
            file_size_bytes: size,
            added_at: Utc::now(),
            status: PipelineStatus::Pending,
            indexed_file_hash: None,
            vector_count: None,
            metadata: FieldMap::new(),
            pipeline_history: Vec::new(),
            last_error: None,
            reprocess_reason: None,
        }
    }
}

/// Why a document was scheduled for (re)processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    New,
    HashChanged,
    /// Content unchanged but the last run did not reach `indexed`.
    Status(PipelineStatus),
    /// Explicitly targeted by the caller.
    Manual,
    UpToDate,
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanReason::New => f.write_str("new"),
            PlanReason::HashChanged => f.write_str("hash_changed"),
            PlanReason::Status(status) => write!(f, "status_{}", status),
            PlanReason::Manual => f.write_str("manual"),
            PlanReason::UpToDate => f.write_str("up_to_date"),
        }
    }
}

/// Decision that one source file needs (re)processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingPlan {
    pub document_id: String,
    pub source_path: PathBuf,
    pub file_hash: String,
    pub reason: PlanReason,
    pub previous_status: Option<PipelineStatus>,
}

/// Output of the parsing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    /// Parsed document body as markdown.
    pub content: String,
    /// Format metadata reported by the parser (api, model, element count).
    #[serde(default)]
    pub metadata: FieldMap,
    /// Pass-through usage statistics (pages billed, etc).
    #[serde(default)]
    pub usage: Value,
    pub source_file: String,
}

/// Fields guessed from a report by the metadata extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub ticker: String,
    pub company_name: String,
    pub date: String,
    pub broker: String,
    pub analyst: Option<String>,
    pub report_type: String,
    pub target_price: Option<u64>,
    pub rating: Option<String>,
    pub source_file: String,
}

impl ReportMetadata {
    pub fn to_fields(&self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => FieldMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Text,
    Table,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Table => "table",
        }
    }
}

/// One indexable unit of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub chunk_type: ChunkType,
    /// 0-based, strictly increasing in emission order.
    pub chunk_index: usize,
    pub document_id: String,
    /// Inherited report metadata.
    pub metadata: FieldMap,
}

impl Chunk {
    /// Metadata stored next to the chunk in the vector store.
    pub fn store_metadata(&self) -> FieldMap {
        let mut map = self.metadata.clone();
        map.insert("document_id".into(), Value::from(self.document_id.clone()));
        map.insert("chunk_type".into(), Value::from(self.chunk_type.as_str()));
        map.insert("chunk_index".into(), Value::from(self.chunk_index));
        map
    }
}

/// A batch failure as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub error: String,
}

/// Aggregate outcome of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Plans left unprocessed because the batch was cancelled.
    pub skipped_count: usize,
    pub failed_files: Vec<FailedFile>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.failed_count == 0
    }
}
