//! Batch pipeline runner.
//!
//! Drives each planned document through `parsing → parsed → chunking →
//! chunked → indexing → indexed`, one document at a time, in plan order.
//!
//! # Failure handling
//!
//! Stage errors are caught once, at the per-document boundary:
//!
//! 1. An indexing failure restores the vector store from the snapshot taken
//!    just before the old vectors were replaced.
//! 2. A parsing failure removes any partially written parse-cache files.
//! 3. A document that was `indexed` before this attempt is rolled back to
//!    that registry record (the failure is still appended to its history);
//!    any other document is marked `failed`.
//!
//! The failure is then reported to the batch, which moves on to the next
//! document. Registry I/O and schema errors are not per-document: they abort
//! the whole batch.
//!
//! Cancellation is checked between documents only. A document that has
//! started runs to completion (or through its failure path).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::Instrument;

use crate::cache::ParseCache;
use crate::config::Config;
use crate::error::{redact_secrets, Error, Result};
use crate::metadata::MetadataExtractor;
use crate::models::{
    DocumentRecord, FailedFile, HistoryEvent, ParseResult, PipelineResult, PipelineStatus,
    PlanReason, ProcessingPlan,
};
use crate::parser::DocumentParser;
use crate::plan::PlanComputer;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::registry::Registry;
use crate::segment::ContentSegmenter;
use crate::vector_store::{Indexer, VectorSnapshot};

/// Why one document did not reach `indexed`.
#[derive(Debug)]
struct DocumentFailure {
    error: Error,
    rolled_back: bool,
}

impl From<Error> for DocumentFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            rolled_back: false,
        }
    }
}

/// Where a failed attempt stopped, and what it can be rolled back with.
struct Attempt {
    stage: PipelineStatus,
    vector_snapshot: Option<VectorSnapshot>,
}

pub struct PipelineRunner {
    registry: Registry,
    cache: ParseCache,
    parser: Arc<dyn DocumentParser>,
    extractor: Arc<dyn MetadataExtractor>,
    segmenter: ContentSegmenter,
    indexer: Indexer,
    raw_dir: PathBuf,
    include_globs: Vec<String>,
    progress: Box<dyn ProgressReporter>,
    cancel: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(
        config: &Config,
        parser: Arc<dyn DocumentParser>,
        extractor: Arc<dyn MetadataExtractor>,
        indexer: Indexer,
    ) -> Self {
        Self {
            registry: Registry::new(&config.paths.registry),
            cache: ParseCache::new(&config.paths.parsed_dir),
            parser,
            extractor,
            segmenter: ContentSegmenter::from_config(&config.chunking),
            indexer,
            raw_dir: config.paths.raw_dir.clone(),
            include_globs: config.paths.include_globs.clone(),
            progress: Box::new(NoProgress),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Shared flag; setting it stops the batch before the next document.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run a batch.
    ///
    /// With `paths`, exactly those files are processed and every plan is
    /// forced to `manual`. Without, the raw directory is scanned and only
    /// documents that are not up to date are processed.
    ///
    /// Only fatal (registry) errors are returned as `Err`; per-document
    /// failures are collected in the result.
    pub async fn run(&self, paths: Option<&[PathBuf]>) -> Result<PipelineResult> {
        let mut result = PipelineResult::default();
        let plans = self.build_plans(paths, &mut result)?;
        let plans = dedupe_within_batch(plans, &mut result);

        result.total = plans.len() + result.failed_count;
        self.progress.report(ProgressEvent::Planned {
            total: result.total,
        });
        tracing::info!(
            planned = plans.len(),
            rejected = result.failed_count,
            "starting batch"
        );

        for (i, plan) in plans.iter().enumerate() {
            if self.is_cancelled() {
                let remaining = plans.len() - i;
                result.skipped_count = remaining;
                self.progress.report(ProgressEvent::Cancelled { remaining });
                tracing::warn!(remaining, "batch cancelled");
                break;
            }

            self.progress.report(ProgressEvent::Started {
                n: i + 1,
                total: plans.len(),
                document_id: plan.document_id.clone(),
                reason: plan.reason.to_string(),
            });

            if !plan.source_path.exists() {
                let error = Error::MissingFile(plan.source_path.clone());
                record_failure(&mut result, &plan.source_path, &error);
                self.progress.report(ProgressEvent::Failed {
                    document_id: plan.document_id.clone(),
                    error: error.to_string(),
                    rolled_back: false,
                });
                continue;
            }

            let span = tracing::info_span!("document", id = %plan.document_id);
            match self.process_one(plan).instrument(span).await {
                Ok(count) => {
                    result.success_count += 1;
                    self.progress.report(ProgressEvent::Indexed {
                        document_id: plan.document_id.clone(),
                        chunk_count: count,
                    });
                }
                Err(failure) if failure.error.is_fatal() => {
                    tracing::error!(error = %failure.error, "registry failure, aborting batch");
                    return Err(failure.error);
                }
                Err(failure) => {
                    record_failure(&mut result, &plan.source_path, &failure.error);
                    self.progress.report(ProgressEvent::Failed {
                        document_id: plan.document_id.clone(),
                        error: redact_secrets(&failure.error.to_string()),
                        rolled_back: failure.rolled_back,
                    });
                }
            }
        }

        tracing::info!(
            total = result.total,
            succeeded = result.success_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            "batch finished"
        );
        Ok(result)
    }

    /// Plans for this batch. Files that cannot even be planned (missing,
    /// unreadable) are recorded as failures in `result`.
    fn build_plans(
        &self,
        paths: Option<&[PathBuf]>,
        result: &mut PipelineResult,
    ) -> Result<Vec<ProcessingPlan>> {
        let data = self.registry.load()?;
        let computer = PlanComputer::new(&data);

        let batch = match paths {
            Some(paths) => computer.plan_files(paths, Some(PlanReason::Manual))?,
            None => computer.plan_directory(&self.raw_dir, &self.include_globs)?,
        };
        for (path, error) in &batch.rejected {
            record_failure(result, path, error);
        }
        Ok(batch.plans)
    }

    async fn process_one(&self, plan: &ProcessingPlan) -> std::result::Result<usize, DocumentFailure> {
        let prior = self.registry.get_document_snapshot(&plan.document_id)?;
        let reason = match plan.reason {
            PlanReason::UpToDate => PlanReason::Manual,
            other => other,
        };

        // Outside the stage boundary: a duplicate leaves no trace in the registry.
        let document_id = self.registry.register_source_file(
            &plan.source_path,
            Some(&plan.file_hash),
            Some(&reason.to_string()),
        )?;
        tracing::info!(reason = %reason, "processing document");

        let mut attempt = Attempt {
            stage: PipelineStatus::Parsing,
            vector_snapshot: None,
        };
        match self.run_stages(&document_id, plan, &mut attempt).await {
            Ok(count) => {
                tracing::info!(vectors = count, "document indexed");
                Ok(count)
            }
            Err(error) => Err(self
                .handle_failure(&document_id, error, attempt, prior.as_ref())
                .await),
        }
    }

    async fn run_stages(
        &self,
        document_id: &str,
        plan: &ProcessingPlan,
        attempt: &mut Attempt,
    ) -> Result<usize> {
        let registry = &self.registry;

        registry.update_status(document_id, PipelineStatus::Parsing)?;
        let parsed = self.load_or_parse(document_id, plan).await?;
        registry.append_history(document_id, HistoryEvent::success(PipelineStatus::Parsed))?;
        registry.update_status(document_id, PipelineStatus::Parsed)?;

        let file_name = file_name_of(&plan.source_path);
        let metadata = self.extractor.extract(&parsed.content, &file_name);
        registry.set_metadata(document_id, metadata.clone())?;

        attempt.stage = PipelineStatus::Chunking;
        registry.update_status(document_id, PipelineStatus::Chunking)?;
        let mut chunks = self.segmenter.segment(&parsed.content, &metadata);
        for chunk in &mut chunks {
            chunk.document_id = document_id.to_string();
        }
        tracing::debug!(chunks = chunks.len(), "segmented");
        let mut chunked = HistoryEvent::success(PipelineStatus::Chunked);
        chunked.chunk_count = Some(chunks.len());
        registry.append_history(document_id, chunked)?;
        registry.update_status(document_id, PipelineStatus::Chunked)?;

        attempt.stage = PipelineStatus::Indexing;
        registry.update_status(document_id, PipelineStatus::Indexing)?;
        attempt.vector_snapshot = Some(self.indexer.snapshot(document_id).await?);
        let count = self.indexer.replace_document(document_id, &chunks).await?;
        let mut indexed = HistoryEvent::success(PipelineStatus::Indexed);
        indexed.vector_count = Some(count);
        registry.append_history(document_id, indexed)?;
        registry.mark_indexed(document_id, &plan.file_hash, Some(count))?;

        Ok(count)
    }

    /// Reuse the parse cache when it was built from this exact file content.
    async fn load_or_parse(&self, document_id: &str, plan: &ProcessingPlan) -> Result<ParseResult> {
        if let Some(cached) = self.cache.load(document_id, &plan.file_hash) {
            tracing::debug!("parse cache hit");
            return Ok(cached);
        }

        let parsed = self.parser.parse(&plan.source_path).await?;
        self.cache.save(document_id, &plan.file_hash, &parsed)?;
        Ok(parsed)
    }

    async fn handle_failure(
        &self,
        document_id: &str,
        error: Error,
        attempt: Attempt,
        prior: Option<&DocumentRecord>,
    ) -> DocumentFailure {
        if error.is_fatal() {
            return error.into();
        }
        let message = redact_secrets(&error.to_string());

        if attempt.stage == PipelineStatus::Indexing {
            if let Some(snapshot) = &attempt.vector_snapshot {
                if let Err(e) = self.indexer.restore(document_id, snapshot).await {
                    tracing::warn!(error = %e, "could not restore vector snapshot");
                }
            }
        }
        if attempt.stage == PipelineStatus::Parsing {
            if let Err(e) = self.cache.remove(document_id) {
                tracing::warn!(error = %e, "could not clean parse cache");
            }
        }

        let rolled_back = prior
            .map(|p| p.status == PipelineStatus::Indexed)
            .unwrap_or(false);
        let recorded = if rolled_back {
            self.registry
                .rollback_document(document_id, prior, attempt.stage, &message)
        } else {
            self.registry
                .mark_failed(document_id, attempt.stage, &message, false)
        };
        if let Err(e) = recorded {
            return e.into();
        }

        tracing::error!(
            stage = %attempt.stage,
            rolled_back,
            error = %message,
            "document failed"
        );
        DocumentFailure { error, rolled_back }
    }
}

/// Drop later plans whose content matches an earlier plan of a different
/// document; they are reported as duplicates without touching the registry.
fn dedupe_within_batch(plans: Vec<ProcessingPlan>, result: &mut PipelineResult) -> Vec<ProcessingPlan> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut kept = Vec::with_capacity(plans.len());

    for plan in plans {
        match seen.get(&plan.file_hash) {
            Some(existing) if *existing != plan.document_id => {
                let error = Error::Duplicate {
                    file: file_name_of(&plan.source_path),
                    existing: existing.clone(),
                };
                tracing::warn!(error = %error, "duplicate within batch");
                record_failure(result, &plan.source_path, &error);
            }
            _ => {
                seen.insert(plan.file_hash.clone(), plan.document_id.clone());
                kept.push(plan);
            }
        }
    }
    kept
}

fn record_failure(result: &mut PipelineResult, path: &Path, error: &Error) {
    result.failed_count += 1;
    result.failed_files.push(FailedFile {
        file: file_name_of(path),
        error: redact_secrets(&error.to_string()),
    });
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
