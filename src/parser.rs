//! Parsing collaborator: PDF in, markdown out.
//!
//! [`DocumentParser`] is the seam the runner depends on. The production
//! implementation, [`HttpDocumentParser`], uploads the PDF to a document-parse
//! HTTP service as multipart form data and pulls the markdown body out of the
//! JSON response. Transient failures are retried here, at the service
//! boundary; the runner only ever sees success or a final error.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::config::ParserConfig;
use crate::error::{Error, Result};
use crate::models::{FieldMap, ParseResult};
use crate::retry::{is_transient, RetryPolicy};

const SERVICE: &str = "document parser";
const PDF_MAGIC: &[u8] = b"%PDF-";

#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<ParseResult>;
}

/// Check that `path` looks like a PDF we are willing to upload.
pub fn validate_pdf(path: &Path, max_bytes: u64) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| Error::source_file(path, e))?;
    if !meta.is_file() {
        return Err(Error::InvalidInput(format!(
            "Not a regular file: {}",
            path.display()
        )));
    }
    let is_pdf = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        return Err(Error::InvalidInput(format!(
            "Not a .pdf file: {}",
            path.display()
        )));
    }
    if meta.len() > max_bytes {
        return Err(Error::InvalidInput(format!(
            "PDF too large ({} bytes, limit {}): {}",
            meta.len(),
            max_bytes,
            path.display()
        )));
    }

    let mut head = [0u8; 5];
    let mut file = std::fs::File::open(path).map_err(|e| Error::source_file(path, e))?;
    let n = file
        .read(&mut head)
        .map_err(|e| Error::source_file(path, e))?;
    if &head[..n] != PDF_MAGIC {
        return Err(Error::InvalidInput(format!(
            "Invalid PDF header: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Markdown body of a parse response.
///
/// Looks at `content.markdown`, then a top-level `markdown`, then joins the
/// per-element `content.markdown` fields with blank lines.
pub fn extract_markdown(payload: &Value) -> Option<String> {
    if let Some(md) = payload
        .pointer("/content/markdown")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return Some(md.to_string());
    }
    if let Some(md) = payload
        .get("markdown")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return Some(md.to_string());
    }

    let parts: Vec<&str> = payload
        .get("elements")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|el| el.pointer("/content/markdown").and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Build a [`ParseResult`] from a successful response body.
pub fn parse_response(payload: &Value, source_file: &str) -> Result<ParseResult> {
    let content = extract_markdown(payload)
        .ok_or_else(|| Error::external(SERVICE, "response contained no markdown content"))?;

    let mut metadata = FieldMap::new();
    metadata.insert(
        "api".into(),
        payload.get("api").cloned().unwrap_or(Value::Null),
    );
    metadata.insert(
        "model".into(),
        payload.get("model").cloned().unwrap_or(Value::Null),
    );
    let element_count = payload
        .get("elements")
        .and_then(Value::as_array)
        .map(|a| a.len())
        .unwrap_or(0);
    metadata.insert("element_count".into(), Value::from(element_count));

    Ok(ParseResult {
        content,
        metadata,
        usage: payload
            .get("usage")
            .cloned()
            .unwrap_or_else(|| Value::Object(FieldMap::new())),
        source_file: source_file.to_string(),
    })
}

/// Multipart client for a document-parse HTTP service.
pub struct HttpDocumentParser {
    client: reqwest::Client,
    endpoint: String,
    mode: String,
    api_key: Option<String>,
    api_key_env: String,
    max_file_bytes: u64,
    retry: RetryPolicy,
}

impl HttpDocumentParser {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::external(SERVICE, format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            mode: config.mode.clone(),
            api_key: config.api_key(),
            api_key_env: config.api_key_env.clone(),
            max_file_bytes: config.max_file_bytes,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_delay_secs),
        })
    }

    fn form(&self, bytes: &[u8], file_name: &str) -> Result<Form> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str("application/pdf")
            .map_err(|e| Error::external(SERVICE, e.to_string()))?;
        Ok(Form::new()
            .part("document", part)
            .text("model", "document-parse")
            .text("ocr", self.mode.clone())
            .text("output_formats", r#"["markdown"]"#)
            .text("coordinates", "false"))
    }

    async fn request_with_retry(&self, api_key: &str, bytes: &[u8], file_name: &str) -> Result<Value> {
        let attempts = self.retry.attempts();

        for attempt in 1..=attempts {
            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(api_key)
                .multipart(self.form(bytes, file_name)?)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            Error::external(SERVICE, format!("invalid JSON response: {}", e))
                        });
                    }

                    if is_transient(status) && attempt < attempts {
                        let delay = self.retry.delay_for_response(attempt, response.headers());
                        tracing::warn!(
                            status = status.as_u16(),
                            attempt,
                            attempts,
                            delay_secs = delay.as_secs_f64(),
                            "document parser returned a transient error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(Error::external(
                        SERVICE,
                        format!("API failed with status {}", status.as_u16()),
                    ));
                }
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.retry.backoff(attempt);
                        tracing::warn!(
                            error = %e,
                            attempt,
                            attempts,
                            delay_secs = delay.as_secs_f64(),
                            "document parser request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(Error::external(SERVICE, format!("request failed: {}", e)));
                }
            }
        }

        Err(Error::external(SERVICE, "retries exhausted"))
    }
}

#[async_trait]
impl DocumentParser for HttpDocumentParser {
    async fn parse(&self, path: &Path) -> Result<ParseResult> {
        validate_pdf(path, self.max_file_bytes)?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::external(SERVICE, format!("{} is required", self.api_key_env)))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::source_file(path, e))?;

        tracing::debug!(file = %file_name, bytes = bytes.len(), "uploading document for parsing");
        let payload = self.request_with_retry(api_key, &bytes, &file_name).await?;
        parse_response(&payload, &file_name)
    }
}
