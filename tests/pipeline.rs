//! End-to-end batch runs against the library API, with a scripted parser and
//! an in-memory vector store that can be told to fail.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use report_ingest::config::Config;
use report_ingest::error::{Error, Result};
use report_ingest::memory_store::MemoryVectorStore;
use report_ingest::metadata::{MetadataExtractor, ReportMetadataExtractor};
use report_ingest::models::{FieldMap, ParseResult, PipelineStatus};
use report_ingest::parser::DocumentParser;
use report_ingest::registry::{compute_file_hash, Registry};
use report_ingest::runner::PipelineRunner;
use report_ingest::vector_store::{Indexer, VectorRecord, VectorSnapshot, VectorStore};

const THREE_SECTIONS: &str = "# 실적\n\n영업이익 개선.\n\n# 전망\n\n수주 증가.\n\n# 투자의견\n\n매수 유지.\n";
const FOUR_SECTIONS: &str =
    "# 실적\n\n영업이익 감소.\n\n# 전망\n\n수주 둔화.\n\n# 리스크\n\n환율.\n\n# 투자의견\n\n중립.\n";

/// Treats each "PDF" as markdown text. Files named `bad*.pdf` fail, and so
/// does the next call after `fail_next` is set.
#[derive(Default)]
struct ScriptedParser {
    calls: AtomicUsize,
    fail_next: AtomicBool,
    cancel_after_first: Mutex<Option<Arc<AtomicBool>>>,
}

#[async_trait]
impl DocumentParser for ScriptedParser {
    async fn parse(&self, path: &Path) -> Result<ParseResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = self.cancel_after_first.lock().unwrap().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        if file_name.starts_with("bad") || self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::external(
                "document parser",
                "API failed with status 400",
            ));
        }
        let content = fs::read_to_string(path).map_err(|e| Error::source_file(path, e))?;
        Ok(ParseResult {
            content,
            metadata: FieldMap::new(),
            usage: json!({"pages": 1}),
            source_file: file_name,
        })
    }
}

/// Extracts nothing, not even `source_file`.
struct EmptyExtractor;

impl MetadataExtractor for EmptyExtractor {
    fn extract(&self, _text: &str, _filename: &str) -> FieldMap {
        FieldMap::new()
    }
}

/// Memory store whose next upsert can be made to fail once.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryVectorStore,
    fail_next_upsert: AtomicBool,
}

#[async_trait]
impl VectorStore for FlakyStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if self.fail_next_upsert.swap(false, Ordering::SeqCst) {
            return Err(Error::external("vector store", "connection reset"));
        }
        self.inner.upsert(records).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.inner.delete_document(document_id).await
    }

    async fn snapshot(&self, document_id: &str) -> Result<VectorSnapshot> {
        self.inner.snapshot(document_id).await
    }
}

struct Harness {
    _tmp: TempDir,
    config: Config,
    parser: Arc<ScriptedParser>,
    store: Arc<FlakyStore>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.paths.registry = tmp.path().join("data/metadata.json");
        config.paths.raw_dir = tmp.path().join("data/raw_pdfs");
        config.paths.parsed_dir = tmp.path().join("data/parsed");
        fs::create_dir_all(&config.paths.raw_dir).unwrap();

        Self {
            _tmp: tmp,
            config,
            parser: Arc::new(ScriptedParser::default()),
            store: Arc::new(FlakyStore::default()),
        }
    }

    fn write_pdf(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.paths.raw_dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn runner(&self) -> PipelineRunner {
        self.runner_with(Arc::new(ReportMetadataExtractor::new()))
    }

    fn runner_with(&self, extractor: Arc<dyn MetadataExtractor>) -> PipelineRunner {
        let store: Arc<dyn VectorStore> = self.store.clone();
        PipelineRunner::new(
            &self.config,
            self.parser.clone(),
            extractor,
            Indexer::new(store, None, 16),
        )
    }

    fn registry(&self) -> Registry {
        Registry::new(&self.config.paths.registry)
    }

    fn parser_calls(&self) -> usize {
        self.parser.calls.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_new_document_is_indexed() {
    let h = Harness::new();
    let path = h.write_pdf("mirae_samsung_20260210.pdf", THREE_SECTIONS);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.success_count, 1);
    assert!(result.is_success());

    let doc = h
        .registry()
        .get_document_snapshot("mirae_samsung_20260210")
        .unwrap()
        .unwrap();
    let hash = compute_file_hash(&path).unwrap();
    assert_eq!(doc.status, PipelineStatus::Indexed);
    assert_eq!(doc.file_hash, hash);
    assert_eq!(doc.indexed_file_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(doc.vector_count, Some(3));
    assert_eq!(doc.metadata["broker"], "미래에셋증권");

    let stages: Vec<_> = doc.pipeline_history.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![
            PipelineStatus::Parsed,
            PipelineStatus::Chunked,
            PipelineStatus::Indexed
        ]
    );
    assert_eq!(doc.pipeline_history[1].chunk_count, Some(3));

    assert_eq!(h.store.count("mirae_samsung_20260210").await.unwrap(), 3);
    let snap = h.store.snapshot("mirae_samsung_20260210").await.unwrap();
    assert_eq!(snap.records[0].id, "mirae_samsung_20260210::chunk_0");
    assert_eq!(snap.records[0].metadata["chunk_type"], "text");
}

#[tokio::test]
async fn test_vectors_are_keyed_by_registry_id_without_metadata() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    h.write_pdf("b.pdf", "# 기타\n\n메모.\n");

    let result = h.runner_with(Arc::new(EmptyExtractor)).run(None).await.unwrap();
    assert_eq!(result.success_count, 2);

    let data = h.registry().load().unwrap();
    assert_eq!(data.documents["a"].vector_count, Some(3));
    assert_eq!(data.documents["b"].vector_count, Some(1));
    assert_eq!(h.store.count("a").await.unwrap(), 3);
    assert_eq!(h.store.count("b").await.unwrap(), 1);
    assert_eq!(h.store.count("").await.unwrap(), 0);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);

    h.runner().run(None).await.unwrap();
    let before = h.registry().load().unwrap().documents;

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 0);
    assert_eq!(result.success_count, 0);
    assert_eq!(h.parser_calls(), 1);
    assert_eq!(h.registry().load().unwrap().documents, before);
}

#[tokio::test]
async fn test_failed_reindex_rolls_back() {
    let h = Harness::new();
    let path = h.write_pdf("a.pdf", THREE_SECTIONS);
    h.runner().run(None).await.unwrap();

    let h1 = compute_file_hash(&path).unwrap();
    let vectors_before = h.store.snapshot("a").await.unwrap();
    assert_eq!(vectors_before.records.len(), 3);

    fs::write(&path, FOUR_SECTIONS).unwrap();
    h.store.fail_next_upsert.store(true, Ordering::SeqCst);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.failed_count, 1);
    assert!(result.failed_files[0].error.contains("connection reset"));

    let doc = h.registry().get_document_snapshot("a").unwrap().unwrap();
    assert_eq!(doc.status, PipelineStatus::Indexed);
    assert_eq!(doc.file_hash, h1);
    assert_eq!(doc.indexed_file_hash.as_deref(), Some(h1.as_str()));
    assert_eq!(doc.vector_count, Some(3));

    let last = doc.pipeline_history.last().unwrap();
    assert!(!last.success);
    assert_eq!(last.stage, PipelineStatus::Indexing);
    assert_eq!(last.rolled_back, Some(true));
    assert_eq!(doc.last_error.as_ref().unwrap().stage, PipelineStatus::Indexing);

    assert_eq!(h.store.snapshot("a").await.unwrap(), vectors_before);
}

#[tokio::test]
async fn test_failed_reparse_of_indexed_document_rolls_back() {
    let h = Harness::new();
    let path = h.write_pdf("a.pdf", THREE_SECTIONS);
    h.runner().run(None).await.unwrap();
    let h1 = compute_file_hash(&path).unwrap();

    fs::write(&path, FOUR_SECTIONS).unwrap();
    h.parser.fail_next.store(true, Ordering::SeqCst);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.failed_count, 1);

    let doc = h.registry().get_document_snapshot("a").unwrap().unwrap();
    assert_eq!(doc.status, PipelineStatus::Indexed);
    assert_eq!(doc.file_hash, h1);
    assert_eq!(doc.indexed_file_hash.as_deref(), Some(h1.as_str()));
    assert_eq!(doc.vector_count, Some(3));

    let last = doc.pipeline_history.last().unwrap();
    assert!(!last.success);
    assert_eq!(last.stage, PipelineStatus::Parsing);
    assert_eq!(last.rolled_back, Some(true));

    let parsed = &h.config.paths.parsed_dir;
    assert!(!parsed.join("a.md").exists());
    assert!(!parsed.join("a.meta.json").exists());
    assert_eq!(h.store.count("a").await.unwrap(), 3);
}

#[tokio::test]
async fn test_rolled_back_document_is_retried() {
    let h = Harness::new();
    let path = h.write_pdf("a.pdf", THREE_SECTIONS);
    h.runner().run(None).await.unwrap();

    fs::write(&path, FOUR_SECTIONS).unwrap();
    h.store.fail_next_upsert.store(true, Ordering::SeqCst);
    h.runner().run(None).await.unwrap();

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.success_count, 1);

    let doc = h.registry().get_document_snapshot("a").unwrap().unwrap();
    assert_eq!(doc.vector_count, Some(4));
    assert_eq!(
        doc.indexed_file_hash.as_deref(),
        Some(compute_file_hash(&path).unwrap().as_str())
    );
    assert!(doc.last_error.is_none());
    assert_eq!(h.store.count("a").await.unwrap(), 4);
}

#[tokio::test]
async fn test_failure_on_first_attempt_marks_failed() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    h.store.fail_next_upsert.store(true, Ordering::SeqCst);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.failed_count, 1);

    let doc = h.registry().get_document_snapshot("a").unwrap().unwrap();
    assert_eq!(doc.status, PipelineStatus::Failed);
    assert!(doc.indexed_file_hash.is_none());
    assert_eq!(doc.pipeline_history.last().unwrap().rolled_back, Some(false));
    assert_eq!(h.store.count("a").await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_of_registered_document() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    h.runner().run(None).await.unwrap();

    h.write_pdf("b.pdf", THREE_SECTIONS);
    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.failed_files[0].file, "b.pdf");
    assert!(result.failed_files[0].error.contains("same as a"));

    let data = h.registry().load().unwrap();
    assert!(!data.documents.contains_key("b"));
    assert_eq!(h.store.count("b").await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_within_one_batch() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    h.write_pdf("b.pdf", THREE_SECTIONS);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 2);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.failed_files[0].file, "b.pdf");

    let data = h.registry().load().unwrap();
    assert_eq!(data.documents.len(), 1);
    assert_eq!(data.documents["a"].status, PipelineStatus::Indexed);
    assert_eq!(h.parser_calls(), 1);
}

#[tokio::test]
async fn test_missing_explicit_file() {
    let h = Harness::new();
    let missing = h.config.paths.raw_dir.join("gone.pdf");

    let result = h.runner().run(Some(&[missing][..])).await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.failed_files[0].file, "gone.pdf");
    assert!(result.failed_files[0].error.contains("does not exist"));
    assert!(h.registry().load().unwrap().documents.is_empty());
}

#[tokio::test]
async fn test_parse_failure_leaves_no_cache() {
    let h = Harness::new();
    h.write_pdf("bad_report.pdf", THREE_SECTIONS);
    h.write_pdf("good.pdf", FOUR_SECTIONS);

    let result = h.runner().run(None).await.unwrap();
    assert_eq!(result.total, 2);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_count, 1);
    assert!(!result.is_success());

    let doc = h
        .registry()
        .get_document_snapshot("bad_report")
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, PipelineStatus::Failed);
    let err = doc.last_error.unwrap();
    assert_eq!(err.stage, PipelineStatus::Parsing);
    assert!(err.message.contains("status 400"));

    let parsed = &h.config.paths.parsed_dir;
    assert!(!parsed.join("bad_report.md").exists());
    assert!(!parsed.join("bad_report.meta.json").exists());
    assert!(parsed.join("good.md").exists());
}

#[tokio::test]
async fn test_manual_run_reuses_parse_cache() {
    let h = Harness::new();
    let path = h.write_pdf("a.pdf", THREE_SECTIONS);
    h.runner().run(None).await.unwrap();
    assert_eq!(h.parser_calls(), 1);

    let result = h.runner().run(Some(&[path][..])).await.unwrap();
    assert_eq!(result.success_count, 1);
    assert_eq!(h.parser_calls(), 1);

    let doc = h.registry().get_document_snapshot("a").unwrap().unwrap();
    assert_eq!(doc.status, PipelineStatus::Indexed);
    assert_eq!(doc.pipeline_history.len(), 6);
    assert_eq!(h.store.count("a").await.unwrap(), 3);
}

#[tokio::test]
async fn test_cancellation_skips_remaining_documents() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    h.write_pdf("b.pdf", FOUR_SECTIONS);
    h.write_pdf("c.pdf", "# 기타\n\n메모.\n");

    let runner = h.runner();
    *h.parser.cancel_after_first.lock().unwrap() = Some(runner.cancel_flag());

    let result = runner.run(None).await.unwrap();
    assert_eq!(result.total, 3);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_count, 0);
    assert_eq!(result.skipped_count, 2);

    let data = h.registry().load().unwrap();
    assert_eq!(data.documents["a"].status, PipelineStatus::Indexed);
    assert!(!data.documents.contains_key("b"));
}

#[tokio::test]
async fn test_unsupported_registry_schema_aborts() {
    let h = Harness::new();
    h.write_pdf("a.pdf", THREE_SECTIONS);
    fs::create_dir_all(h.config.paths.registry.parent().unwrap()).unwrap();
    let registry: Value = json!({
        "schema_version": "2.0.0",
        "last_updated": "2026-01-01T00:00:00Z",
        "documents": {}
    });
    fs::write(&h.config.paths.registry, registry.to_string()).unwrap();

    let err = h.runner().run(None).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedSchema { .. }));
    assert!(err.is_fatal());
    assert_eq!(h.parser_calls(), 0);
}
