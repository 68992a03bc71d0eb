//! Embedding providers.
//!
//! Defines the [`Embedder`] trait and two HTTP implementations:
//! - **[`OpenAIEmbedder`]**: `POST https://api.openai.com/v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! With `provider = "disabled"`, [`create_embedder`] returns `None` and chunks
//! are indexed without vectors.
//!
//! # Retry Strategy
//!
//! Both providers retry through [`RetryPolicy`](crate::retry::RetryPolicy):
//! - HTTP 429 and 5xx gateway/unavailable → retry
//! - Other HTTP errors → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, ...

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::retry::{is_transient, RetryPolicy};

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const BACKOFF_BASE_SECS: f64 = 1.0;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the configured provider, or `None` when embeddings are disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

fn required_model(config: &EmbeddingConfig, provider: &str) -> anyhow::Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

fn http_client(config: &EmbeddingConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// POST `body` as JSON with retry/backoff, returning the decoded response.
async fn post_with_retry(
    service: &str,
    request: impl Fn() -> reqwest::RequestBuilder,
    retry: RetryPolicy,
) -> Result<Value> {
    let attempts = retry.attempts();
    let mut last_err = None;

    for attempt in 1..=attempts {
        match request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        Error::external(service, format!("invalid JSON response: {}", e))
                    });
                }

                let retry_delay = retry.delay_for_response(attempt, response.headers());
                let body_text = response.text().await.unwrap_or_default();
                let err = Error::external(service, format!("API error {}: {}", status, body_text));
                if !is_transient(status) {
                    return Err(err);
                }
                last_err = Some(err);
                if attempt < attempts {
                    tracing::warn!(service, status = status.as_u16(), attempt, attempts, "embedding request throttled, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
            Err(e) => {
                last_err = Some(Error::external(service, format!("request failed: {}", e)));
                if attempt < attempts {
                    tracing::warn!(service, error = %e, attempt, attempts, "embedding request failed, retrying");
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::external(service, "embedding failed after retries")))
}

fn check_count(service: &str, vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(Error::external(
            service,
            format!("expected {} embeddings, got {}", expected, vectors.len()),
        ));
    }
    Ok(vectors)
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    retry: RetryPolicy,
}

impl OpenAIEmbedder {
    /// Fails if `model`/`dims` are missing or `OPENAI_API_KEY` is not set.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let (model, dims) = required_model(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client(config)?,
            api_key,
            model,
            dims,
            retry: RetryPolicy::new(config.max_retries, BACKOFF_BASE_SECS),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            "OpenAI embeddings",
            || {
                self.client
                    .post(OPENAI_URL)
                    .bearer_auth(&self.api_key)
                    .json(&body)
            },
            self.retry,
        )
        .await?;
        check_count("OpenAI embeddings", parse_openai_response(&json)?, texts.len())
    }
}

/// `data[].embedding`, reordered by `data[].index` when present.
pub fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::external("OpenAI embeddings", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::external("OpenAI embeddings", "missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    retry: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let (model, dims) = required_model(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            retry: RetryPolicy::new(config.max_retries, BACKOFF_BASE_SECS),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url);
        let json = post_with_retry(
            "Ollama embeddings",
            || self.client.post(&endpoint).json(&body),
            self.retry,
        )
        .await?;
        check_count("Ollama embeddings", parse_ollama_response(&json)?, texts.len())
    }
}

pub fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::external("Ollama embeddings", "missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|a| to_f32(a))
                .ok_or_else(|| Error::external("Ollama embeddings", "embedding is not an array"))
        })
        .collect()
}

fn to_f32(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverse of [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
