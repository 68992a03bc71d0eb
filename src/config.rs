//! TOML configuration.
//!
//! A single [`Config`] value is loaded once by the CLI and handed to every
//! component at construction time. Secrets are never read from the file:
//! the parser API key is looked up in the environment variable named by
//! `parser.api_key_env`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_registry_path")]
    pub registry: PathBuf,
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    #[serde(default = "default_parsed_dir")]
    pub parsed_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry: default_registry_path(),
            raw_dir: default_raw_dir(),
            parsed_dir: default_parsed_dir(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/metadata.json")
}
fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw_pdfs")
}
fn default_parsed_dir() -> PathBuf {
    PathBuf::from("data/parsed")
}
fn default_include_globs() -> Vec<String> {
    vec!["*.pdf".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default = "default_parser_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_parse_mode")]
    pub mode: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_parser_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_parser_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: f64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_parser_endpoint(),
            mode: default_parse_mode(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_parser_timeout(),
            max_retries: default_parser_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl ParserConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

fn default_parser_endpoint() -> String {
    "https://api.upstage.ai/v1/document-digitization".to_string()
}
fn default_parse_mode() -> String {
    "auto".to_string()
}
fn default_api_key_env() -> String {
    "UPSTAGE_API_KEY".to_string()
}
fn default_parser_timeout() -> u64 {
    300
}
fn default_parser_retries() -> u32 {
    3
}
fn default_retry_base_delay() -> f64 {
    2.0
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_vector_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_vector_path(),
            collection: default_collection(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("data/vectors.sqlite")
}
fn default_collection() -> String {
    "securities_reports".to_string()
}

/// Upper bound on configured retry counts; backoff doubles per attempt.
const MAX_RETRIES_LIMIT: u32 = 10;

impl Config {
    /// Defaults for commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            paths: PathsConfig::default(),
            chunking: ChunkingConfig::default(),
            parser: ParserConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }

        if self.paths.include_globs.is_empty() {
            anyhow::bail!("paths.include_globs must contain at least one pattern");
        }

        if self.parser.max_retries > MAX_RETRIES_LIMIT {
            anyhow::bail!("parser.max_retries must be <= {}", MAX_RETRIES_LIMIT);
        }
        if self.parser.retry_base_delay_secs < 0.0 {
            anyhow::bail!("parser.retry_base_delay_secs must be >= 0");
        }

        if self.embedding.max_retries > MAX_RETRIES_LIMIT {
            anyhow::bail!("embedding.max_retries must be <= {}", MAX_RETRIES_LIMIT);
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        match self.vector_store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!(
                "Unknown vector_store.backend: '{}'. Must be sqlite or memory.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.paths.registry, PathBuf::from("data/metadata.json"));
        assert_eq!(config.paths.include_globs, vec!["*.pdf".to_string()]);
        assert_eq!(config.parser.max_retries, 3);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.vector_store.backend, "sqlite");
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = parse("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let ok = parse(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        assert!(ok.embedding.is_enabled());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = parse("[vector_store]\nbackend = \"chroma\"\n").unwrap_err();
        assert!(err.to_string().contains("vector_store.backend"));
    }

    #[test]
    fn test_retry_limit() {
        let err = parse("[parser]\nmax_retries = 50\n").unwrap_err();
        assert!(err.to_string().contains("parser.max_retries"));
    }

    #[test]
    fn test_minimal_is_valid() {
        Config::minimal().validate().unwrap();
    }
}
