//! Batch progress reporting.
//!
//! Reports what `ingest run` is doing so users can follow a long batch:
//! how many documents were planned, which one is being processed, and how
//! each one ended. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts. Logs (`tracing`) are a separate channel.

use std::io::Write;

/// A single progress event for a batch run.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Plans computed; `total` documents will be attempted.
    Planned { total: usize },
    /// Document `n` of `total` is starting.
    Started {
        n: usize,
        total: usize,
        document_id: String,
        reason: String,
    },
    /// Document reached `indexed`.
    Indexed {
        document_id: String,
        chunk_count: usize,
    },
    /// Document failed; `rolled_back` when a previous good state was restored.
    Failed {
        document_id: String,
        error: String,
        rolled_back: bool,
    },
    /// Batch stopped early; `remaining` plans were not attempted.
    Cancelled { remaining: usize },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest [2/5] mirae_samsung_20260210 (new)".
pub struct StderrProgress;

impl StderrProgress {
    fn line(event: &ProgressEvent) -> String {
        match event {
            ProgressEvent::Planned { total } => {
                format!("ingest  {} document(s) planned\n", format_number(*total))
            }
            ProgressEvent::Started {
                n,
                total,
                document_id,
                reason,
            } => format!("ingest [{}/{}] {} ({})\n", n, total, document_id, reason),
            ProgressEvent::Indexed {
                document_id,
                chunk_count,
            } => format!("ingest  {}  indexed  {} chunks\n", document_id, chunk_count),
            ProgressEvent::Failed {
                document_id,
                error,
                rolled_back,
            } => {
                let suffix = if *rolled_back { " (rolled back)" } else { "" };
                format!("ingest  {}  FAILED{}: {}\n", document_id, suffix, error)
            }
            ProgressEvent::Cancelled { remaining } => {
                format!("ingest  cancelled, {} document(s) skipped\n", remaining)
            }
        }
    }
}

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = Self::line(&event);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn value(event: &ProgressEvent) -> serde_json::Value {
        match event {
            ProgressEvent::Planned { total } => serde_json::json!({
                "event": "planned",
                "total": total
            }),
            ProgressEvent::Started {
                n,
                total,
                document_id,
                reason,
            } => serde_json::json!({
                "event": "started",
                "n": n,
                "total": total,
                "document_id": document_id,
                "reason": reason
            }),
            ProgressEvent::Indexed {
                document_id,
                chunk_count,
            } => serde_json::json!({
                "event": "indexed",
                "document_id": document_id,
                "chunk_count": chunk_count
            }),
            ProgressEvent::Failed {
                document_id,
                error,
                rolled_back,
            } => serde_json::json!({
                "event": "failed",
                "document_id": document_id,
                "error": error,
                "rolled_back": rolled_back
            }),
            ProgressEvent::Cancelled { remaining } => serde_json::json!({
                "event": "cancelled",
                "remaining": remaining
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::value(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
