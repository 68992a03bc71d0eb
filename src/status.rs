//! Registry overview for `ingest status`.
//!
//! Renders either a per-status summary of every document or the full record
//! (including its audit trail) of one document. Rendering returns strings so
//! the CLI decides where they go.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::models::{DocumentRecord, PipelineStatus};
use crate::registry::RegistryData;

/// Document counts keyed by status, in pipeline order.
pub fn count_by_status(data: &RegistryData) -> BTreeMap<usize, (PipelineStatus, usize)> {
    let mut counts = BTreeMap::new();
    for (order, status) in PipelineStatus::ALL.iter().enumerate() {
        let n = data
            .documents
            .values()
            .filter(|d| d.status == *status)
            .count();
        if n > 0 {
            counts.insert(order, (*status, n));
        }
    }
    counts
}

pub fn render_summary(data: &RegistryData, registry_path: &Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Report Ingest: Registry Status");
    let _ = writeln!(out, "===============================");
    let _ = writeln!(out);
    let _ = writeln!(out, "  Registry:    {}", registry_path.display());
    let _ = writeln!(out, "  Schema:      {}", data.schema_version);
    let _ = writeln!(out, "  Updated:     {}", format_relative(data.last_updated));
    let _ = writeln!(out, "  Documents:   {}", data.documents.len());

    let counts = count_by_status(data);
    if !counts.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  By status:");
        for (status, n) in counts.values() {
            let _ = writeln!(out, "    {:<10} {:>6}", status.as_str(), n);
        }
    }

    let failed: Vec<&DocumentRecord> = data
        .documents
        .values()
        .filter(|d| d.status == PipelineStatus::Failed || d.last_error.is_some())
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Recent errors:");
        let _ = writeln!(out, "  {:<36} {:<10} {}", "DOCUMENT", "STAGE", "ERROR");
        let _ = writeln!(out, "  {}", "-".repeat(76));
        for doc in failed {
            if let Some(err) = &doc.last_error {
                let _ = writeln!(
                    out,
                    "  {:<36} {:<10} {}",
                    doc.document_id,
                    err.stage.as_str(),
                    truncate(&err.message, 60)
                );
            }
        }
    }
    out
}

pub fn render_document(doc: &DocumentRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Document:      {}", doc.document_id);
    let _ = writeln!(out, "Source file:   {}", doc.source_file);
    let _ = writeln!(out, "Status:        {}", doc.status);
    let _ = writeln!(out, "File hash:     {}", doc.file_hash);
    let _ = writeln!(
        out,
        "Indexed hash:  {}",
        doc.indexed_file_hash.as_deref().unwrap_or("-")
    );
    let _ = writeln!(
        out,
        "Vectors:       {}",
        doc.vector_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    let _ = writeln!(out, "Size:          {} bytes", doc.file_size_bytes);
    let _ = writeln!(out, "Added:         {}", doc.added_at.format("%Y-%m-%d %H:%M"));
    if let Some(reason) = &doc.reprocess_reason {
        let _ = writeln!(out, "Reprocess:     {}", reason);
    }
    if let Some(err) = &doc.last_error {
        let _ = writeln!(out, "Last error:    [{}] {}", err.stage, err.message);
    }

    if !doc.metadata.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Metadata:");
        for (key, value) in &doc.metadata {
            let shown = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let _ = writeln!(out, "  {:<14} {}", key, shown);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "History:");
    for event in &doc.pipeline_history {
        let mut line = format!(
            "  {}  {:<9} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.stage.as_str(),
            if event.success { "ok" } else { "FAILED" }
        );
        if let Some(n) = event.chunk_count {
            let _ = write!(line, "  chunks={}", n);
        }
        if let Some(n) = event.vector_count {
            let _ = write!(line, "  vectors={}", n);
        }
        if event.rolled_back == Some(true) {
            line.push_str("  rolled_back");
        }
        if let Some(msg) = &event.error_message {
            let _ = write!(line, "  {}", truncate(msg, 80));
        }
        let _ = writeln!(out, "{}", line);
    }
    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut)
}

/// Relative time ("3 hours ago"), falling back to a date after 30 days.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
