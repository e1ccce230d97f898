//! Local embedding server over HTTP (Ollama `/api/embeddings`)

use super::Embedder;
use super::retry::retry_with_backoff;
use crate::config::EmbeddingConfig;
use crate::error::{CodectxError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            max_retries: config.max_retries,
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CodectxError::Embedding(format!(
                "{} returned {}: {}",
                self.model, status, body
            )));
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(CodectxError::Embedding(format!(
                "{} returned an empty embedding",
                self.model
            )));
        }

        Ok(body.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        retry_with_backoff(self.max_retries, Duration::from_millis(250), || {
            self.request(text)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingGate, is_zero};

    #[tokio::test]
    async fn test_unreachable_server_degrades_to_zero_vector() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            dimension: 16,
            max_retries: 0,
            timeout_secs: 1,
            ..EmbeddingConfig::default()
        };
        let gate = EmbeddingGate::new(Box::new(OllamaEmbedder::new(&config)));

        let v = gate.embed("fn main() {}").await;
        assert_eq!(v.len(), 16);
        assert!(is_zero(&v));
    }

    #[tokio::test]
    async fn test_blank_text_skips_request() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            dimension: 8,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config);
        assert_eq!(embedder.embed("   ").await.unwrap(), vec![0.0; 8]);
    }
}
