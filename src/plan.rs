//! Processing plans: which source files need (re)processing, and why.
//!
//! Planning is a pure read of a registry snapshot plus the file's current
//! content hash. Nothing here mutates the registry.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::{PipelineStatus, PlanReason, ProcessingPlan};
use crate::registry::{compute_file_hash, document_id_for, RegistryData};

/// Decides plans against one loaded registry snapshot.
pub struct PlanComputer<'a> {
    registry: &'a RegistryData,
}

impl<'a> PlanComputer<'a> {
    pub fn new(registry: &'a RegistryData) -> Self {
        Self { registry }
    }

    /// Plan a single candidate file.
    ///
    /// `override_reason` replaces whatever reason the registry state would
    /// give; targeted runs pass [`PlanReason::Manual`].
    pub fn plan_for_file(
        &self,
        path: &Path,
        override_reason: Option<PlanReason>,
    ) -> Result<ProcessingPlan> {
        let file_hash = compute_file_hash(path).map_err(|e| Error::source_file(path, e))?;
        let document_id = document_id_for(path);
        let existing = self.registry.documents.get(&document_id);

        let reason = match existing {
            None => PlanReason::New,
            Some(doc) if doc.file_hash != file_hash => PlanReason::HashChanged,
            Some(doc) if doc.status != PipelineStatus::Indexed => PlanReason::Status(doc.status),
            Some(_) => PlanReason::UpToDate,
        };

        Ok(ProcessingPlan {
            document_id,
            source_path: path.to_path_buf(),
            file_hash,
            reason: override_reason.unwrap_or(reason),
            previous_status: existing.map(|doc| doc.status),
        })
    }

    /// Plan each of `paths` in order, dropping the ones that are already up
    /// to date. Files that cannot be planned (missing, unreadable) are
    /// collected in [`PlanBatch::rejected`]; only registry errors fail the
    /// whole call.
    pub fn plan_files(
        &self,
        paths: &[PathBuf],
        override_reason: Option<PlanReason>,
    ) -> Result<PlanBatch> {
        let mut batch = PlanBatch::default();
        for path in paths {
            match self.plan_for_file(path, override_reason) {
                Ok(plan) if plan.reason == PlanReason::UpToDate => {
                    tracing::debug!(document_id = %plan.document_id, "up to date");
                }
                Ok(plan) => batch.plans.push(plan),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot plan file");
                    batch.rejected.push((path.clone(), e));
                }
            }
        }
        Ok(batch)
    }

    /// Plan every candidate in `dir`, in file-name order. A missing
    /// directory yields an empty batch.
    pub fn plan_directory(&self, dir: &Path, include_globs: &[String]) -> Result<PlanBatch> {
        let candidates = scan_candidates(dir, include_globs)?;
        self.plan_files(&candidates, None)
    }
}

/// Plans for one batch, plus the candidates that could not be planned.
#[derive(Debug, Default)]
pub struct PlanBatch {
    pub plans: Vec<ProcessingPlan>,
    pub rejected: Vec<(PathBuf, Error)>,
}

/// Regular files directly under `dir` whose file name matches one of the
/// globs, sorted lexicographically by file name.
pub fn scan_candidates(dir: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "source directory does not exist");
        return Ok(Vec::new());
    }

    let include_set = build_globset(include_globs)?;
    let mut paths = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::SourceFile {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if include_set.is_match(&name) {
            paths.push(entry.into_path());
        }
    }

    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("bad include glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("bad include globs: {}", e)))
}
