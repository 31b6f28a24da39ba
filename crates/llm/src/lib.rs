use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use mnemo_config::LlmConfig;

// ── Capability trait ──────────────────────────────────────────────────────────

/// Per-request generation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    /// Optional system instruction sent alongside the prompt.
    #[serde(default)]
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            system: None,
        }
    }
}

impl CompletionOptions {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

/// Black-box text completion and embedding service.
///
/// Every failure (transport error, timeout, non-success status, missing
/// field) is an `Err`.  Callers rely on this to abort an operation without
/// touching state.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;

    /// Stream incremental text through `tx` and return the full text.
    ///
    /// The default forwards the whole completion as a single chunk.
    async fn complete_stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let text = self.complete(prompt, options).await?;
        let _ = tx.send(text.clone()).await;
        Ok(text)
    }
}

// ── Ollama ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: embedding_model.into(),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            &config.model,
            &config.embedding_model,
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn generate_payload(&self, prompt: &str, options: &CompletionOptions, stream: bool) -> serde_json::Value {
        let mut payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": stream,
            "options": { "temperature": options.temperature },
        });
        if let Some(system) = &options.system {
            payload["system"] = json!(system);
        }
        payload
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/api/embeddings", self.base_url);
        let payload = json!({
            "model": self.embedding_model,
            "prompt": text,
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Ollama unavailable at {}", self.base_url))?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama embedding error ({status}): {body}");
        }

        let vector = body
            .get("embedding")
            .and_then(|value| value.as_array())
            .context("Ollama embedding response missing `embedding`")?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<_>>();
        if vector.is_empty() {
            bail!("Ollama returned an empty embedding for model '{}'", self.embedding_model);
        }
        Ok(vector)
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let payload = self.generate_payload(prompt, options, false);

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Ollama unavailable at {}. Start Ollama and ensure model '{}' is installed",
                    self.base_url, self.model
                )
            })?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama error ({status}): {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(content.to_string()),
            None => bail!("Ollama response missing text: {body}"),
        }
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let payload = self.generate_payload(prompt, options, true);

        let mut response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Ollama unavailable at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama error ({status}): {body}");
        }

        let mut lines = NdjsonLines::default();
        let mut full_response = String::new();
        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                forward_stream_line(&line, &mut full_response, &tx).await?;
            }
        }
        if let Some(tail) = lines.finish() {
            forward_stream_line(&tail, &mut full_response, &tx).await?;
        }

        debug!(chars = full_response.len(), "ollama stream finished");
        Ok(full_response)
    }
}

/// Splits a byte stream into NDJSON lines.
///
/// Lines and multi-byte characters may straddle network chunks, so bytes are
/// buffered and only complete lines are decoded.
#[derive(Debug, Default)]
struct NdjsonLines {
    pending: Vec<u8>,
}

impl NdjsonLines {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..newline]).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

async fn forward_stream_line(
    line: &str,
    full_response: &mut String,
    tx: &mpsc::Sender<String>,
) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let json: serde_json::Value = match serde_json::from_str(line) {
        Ok(json) => json,
        Err(_) => return Ok(()),
    };
    if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
        bail!("Ollama stream error: {error}");
    }
    if let Some(content) = json.get("response").and_then(|v| v.as_str()) {
        if !content.is_empty() {
            full_response.push_str(content);
            let _ = tx.send(content.to_string()).await;
        }
    }
    Ok(())
}

// ── Output helpers ────────────────────────────────────────────────────────────

/// Drop the reasoning preamble that reasoning models emit before the answer.
///
/// Everything up to and including the last `</think>` is removed.  Text
/// without a closing tag is returned trimmed but otherwise unchanged.
pub fn strip_reasoning(response: &str) -> &str {
    match response.rfind("</think>") {
        Some(pos) => response[pos + "</think>".len()..].trim(),
        None => response.trim(),
    }
}

/// Extract the first valid JSON document from an LLM response.
///
/// Tries a fenced ` ```json ` block first, then the span from the first `{`
/// to the last `}`.  Returns `None` when neither parses.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            let json_str = after_fence[..fence_end].trim();
            if let Ok(val) = serde_json::from_str(json_str) {
                return Some(val);
            }
        }
    }

    let trimmed = response.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(val) = serde_json::from_str(&trimmed[start..=end]) {
                return Some(val);
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────
