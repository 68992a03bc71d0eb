//! On-disk parse cache.
//!
//! Each parsed document is stored as two files under the parsed directory:
//! `{document_id}.md` with the markdown body and `{document_id}.meta.json`
//! describing which source hash produced it. The descriptor is written last,
//! so a body without a matching descriptor is never trusted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{FieldMap, ParseResult};

/// Sidecar descriptor stored next to the cached markdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub document_id: String,
    pub source_file: String,
    pub file_hash: String,
    pub parse_format: String,
    #[serde(default)]
    pub parse_metadata: FieldMap,
    #[serde(default)]
    pub usage: Value,
}

#[derive(Debug, Clone)]
pub struct ParseCache {
    dir: PathBuf,
}

impl ParseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn markdown_path(&self, document_id: &str) -> PathBuf {
        self.dir.join(format!("{}.md", document_id))
    }

    pub fn descriptor_path(&self, document_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", document_id))
    }

    /// Cached parse for `document_id` if it was derived from `file_hash`.
    ///
    /// Missing, unreadable or stale entries are a miss, not an error.
    pub fn load(&self, document_id: &str, file_hash: &str) -> Option<ParseResult> {
        let descriptor_path = self.descriptor_path(document_id);
        let raw = fs::read_to_string(&descriptor_path).ok()?;
        let descriptor: CacheDescriptor = match serde_json::from_str(&raw) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    path = %descriptor_path.display(),
                    error = %e,
                    "ignoring unreadable parse cache descriptor"
                );
                return None;
            }
        };
        if descriptor.file_hash != file_hash {
            tracing::debug!(document_id, "parse cache is stale");
            return None;
        }

        let content = fs::read_to_string(self.markdown_path(document_id)).ok()?;
        Some(ParseResult {
            content,
            metadata: descriptor.parse_metadata,
            usage: descriptor.usage,
            source_file: descriptor.source_file,
        })
    }

    /// Persist a parse result produced from `file_hash`.
    pub fn save(&self, document_id: &str, file_hash: &str, result: &ParseResult) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|source| Error::Cache {
            path: self.dir.clone(),
            source,
        })?;

        let descriptor = CacheDescriptor {
            document_id: document_id.to_string(),
            source_file: result.source_file.clone(),
            file_hash: file_hash.to_string(),
            parse_format: "markdown".to_string(),
            parse_metadata: result.metadata.clone(),
            usage: result.usage.clone(),
        };
        let json = serde_json::to_string_pretty(&descriptor)
            .map_err(|e| Error::InvalidInput(format!("cannot encode cache descriptor: {}", e)))?;

        write_atomic(&self.markdown_path(document_id), result.content.as_bytes())?;
        write_atomic(&self.descriptor_path(document_id), json.as_bytes())?;
        Ok(())
    }

    /// Remove both artifacts. Missing files are fine.
    pub fn remove(&self, document_id: &str) -> Result<()> {
        for path in [
            self.descriptor_path(document_id),
            self.markdown_path(document_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(Error::Cache { path, source }),
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let cache_err = |source| Error::Cache {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(&tmp).map_err(cache_err)?;
    file.write_all(bytes).map_err(cache_err)?;
    file.sync_all().map_err(cache_err)?;
    fs::rename(&tmp, path).map_err(cache_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result() -> ParseResult {
        let mut metadata = FieldMap::new();
        metadata.insert("model".into(), Value::from("document-parse"));
        ParseResult {
            content: "# 삼성전자\n\n본문".to_string(),
            metadata,
            usage: serde_json::json!({"pages": 3}),
            source_file: "doc.pdf".to_string(),
        }
    }

    #[test]
    fn test_roundtrip_with_matching_hash() {
        let tmp = TempDir::new().unwrap();
        let cache = ParseCache::new(tmp.path().join("parsed"));
        cache.save("doc", "sha256:aa", &result()).unwrap();

        let loaded = cache.load("doc", "sha256:aa").unwrap();
        assert_eq!(loaded, result());

        let raw = fs::read_to_string(cache.descriptor_path("doc")).unwrap();
        let descriptor: CacheDescriptor = serde_json::from_str(&raw).unwrap();
        assert_eq!(descriptor.parse_format, "markdown");
        assert_eq!(descriptor.document_id, "doc");
    }

    #[test]
    fn test_stale_hash_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ParseCache::new(tmp.path());
        cache.save("doc", "sha256:aa", &result()).unwrap();
        assert!(cache.load("doc", "sha256:bb").is_none());
    }

    #[test]
    fn test_body_without_descriptor_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ParseCache::new(tmp.path());
        fs::write(cache.markdown_path("doc"), "orphan").unwrap();
        assert!(cache.load("doc", "sha256:aa").is_none());
    }

    #[test]
    fn test_corrupt_descriptor_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ParseCache::new(tmp.path());
        cache.save("doc", "sha256:aa", &result()).unwrap();
        fs::write(cache.descriptor_path("doc"), "{ nope").unwrap();
        assert!(cache.load("doc", "sha256:aa").is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let cache = ParseCache::new(tmp.path());
        cache.save("doc", "sha256:aa", &result()).unwrap();
        cache.remove("doc").unwrap();
        assert!(!cache.markdown_path("doc").exists());
        assert!(!cache.descriptor_path("doc").exists());
        cache.remove("doc").unwrap();
    }
}
