//! LLM/embedding collaborator behind a trait seam.
//!
//! The provider is a remote black box: text in, JSON or a vector out,
//! rate-limited and non-deterministic. Everything that consumes it treats
//! failure as a degraded result, never a run failure. Response parsing is
//! defensive — malformed provider JSON is an error value, not a panic.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::error::FetchError;
use crate::net::{send_with_retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Provider error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Fetch(FetchError::Http(e))
    }
}

#[async_trait]
pub trait IntelligenceProvider: Send + Sync {
    /// Free-form completion against the configured generation model.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, ProviderError>;

    /// Embedding vector for one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Client for an OpenAI-style HTTP endpoint.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    generate_model: String,
    embed_model: String,
    retry: RetryPolicy,
}

impl HttpProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone().unwrap_or_default(),
            generate_model: cfg.generate_model.clone(),
            embed_model: cfg.embed_model.clone(),
            retry: RetryPolicy::default(),
        }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = send_with_retry(
            self.http.post(&url).bearer_auth(&self.api_key).json(&body),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await.map_err(FetchError::Http)?)
    }
}

#[async_trait]
impl IntelligenceProvider for HttpProvider {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.generate_model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let value = self.post_json("/v1/chat/completions", body).await?;
        parse_generate_response(&value)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.embed_model,
            "input": text,
        });
        let value = self.post_json("/v1/embeddings", body).await?;
        parse_embed_response(&value)
    }
}

/// Build a provider from config, when one is enabled and reachable.
pub fn build_provider(cfg: &ProviderConfig) -> Option<Box<dyn IntelligenceProvider>> {
    if !cfg.enabled || cfg.base_url.is_empty() {
        return None;
    }
    Some(Box::new(HttpProvider::new(cfg)))
}

/// `choices[0].message.content` as a non-empty string.
pub fn parse_generate_response(value: &Value) -> Result<String, ProviderError> {
    value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedResponse("missing choices[0].message.content".into()))
}

/// `data[0].embedding` as an f32 vector.
pub fn parse_embed_response(value: &Value) -> Result<Vec<f32>, ProviderError> {
    let embedding = value
        .get("data")
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .and_then(|d| d.get("embedding"))
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse("missing data[0].embedding".into()))?;

    let mut out = Vec::with_capacity(embedding.len());
    for v in embedding {
        match v.as_f64() {
            Some(f) => out.push(f as f32),
            None => {
                return Err(ProviderError::MalformedResponse(
                    "non-numeric embedding element".into(),
                ))
            }
        }
    }
    Ok(out)
}
