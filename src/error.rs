//! Error taxonomy for the ingestion pipeline.
//!
//! Every fallible library operation returns [`Error`]. The variants form a
//! closed set so the runner can decide, per failure, whether it belongs to a
//! single document (recorded in the registry, batch continues) or to the
//! infrastructure (batch aborts). See [`Error::is_fatal`].

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Two distinct documents would share byte-identical content.
    #[error("Duplicate document detected: {file} (same as {existing})")]
    Duplicate { file: String, existing: String },

    /// A collaborator (parser, embedder, vector store) failed or exhausted its retries.
    #[error("{service} failed: {message}")]
    ExternalService { service: String, message: String },

    /// The persisted registry carries a schema version this build cannot read.
    #[error("Unsupported registry schema version: {version}")]
    UnsupportedSchema { version: String },

    /// A planned source file disappeared before it could be processed.
    #[error("File does not exist: {}", .0.display())]
    MissingFile(PathBuf),

    /// A source file exists but could not be read or inspected.
    #[error("Cannot read source file {}: {source}", path.display())]
    SourceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("Registry I/O error at {}: {source}", path.display())]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry file {} is malformed: {source}", path.display())]
    RegistryFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing a parse-cache artifact failed.
    #[error("Parse cache error at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Map an I/O failure on a source file, distinguishing a vanished file.
    pub fn source_file(path: &std::path::Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::MissingFile(path.to_path_buf())
        } else {
            Self::SourceFile {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Infrastructure failures abort the whole batch instead of being
    /// recorded against a single document.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RegistryIo { .. } | Error::RegistryFormat { .. } | Error::UnsupportedSchema { .. }
        )
    }
}

fn secret_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"sk-[a-zA-Z0-9]{20,}", "sk-****"),
            (r"xoxb-[a-zA-Z0-9-]+", "xoxb-****"),
            (r"xapp-[a-zA-Z0-9-]+", "xapp-****"),
            (r"up_[a-zA-Z0-9]+", "up_****"),
        ]
        .into_iter()
        .filter_map(|(pattern, mask)| Regex::new(pattern).ok().map(|re| (re, mask)))
        .collect()
    })
}

/// Mask API keys and tokens before a message reaches logs or the registry history.
pub fn redact_secrets(message: &str) -> String {
    let mut out = message.to_string();
    for (re, mask) in secret_patterns() {
        out = re.replace_all(&out, *mask).into_owned();
    }
    out
}
