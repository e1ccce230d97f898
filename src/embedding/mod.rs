//! Embedding providers
//!
//! Text goes in, a fixed-length normalized vector comes out. Providers may fail
//! internally; the [`EmbeddingGate`] turns any failure into the zero vector, which
//! callers treat as "unscored".

pub mod hashed;
pub mod ollama;
pub mod retry;

pub use hashed::HashedEmbedder;
pub use ollama::OllamaEmbedder;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name for logs and stats.
    fn name(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Serializes all embedding calls through one lock and never fails.
pub struct EmbeddingGate {
    embedder: Box<dyn Embedder>,
    lock: Mutex<()>,
}

impl EmbeddingGate {
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        Self {
            embedder,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let embedder: Box<dyn Embedder> = match config.provider {
            EmbeddingProviderKind::Hashed => Box::new(HashedEmbedder::new(config.dimension)),
            EmbeddingProviderKind::Ollama => Box::new(OllamaEmbedder::new(config)),
        };
        Self::new(embedder)
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn provider_name(&self) -> &str {
        self.embedder.name()
    }

    /// Embed `text`, substituting the zero vector on any failure.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let dimension = self.embedder.dimension();
        let _guard = self.lock.lock().await;

        match self.embedder.embed(text).await {
            Ok(vector) if vector.len() == dimension => normalize(vector),
            Ok(vector) => {
                warn!(
                    provider = self.embedder.name(),
                    expected = dimension,
                    got = vector.len(),
                    "Embedding dimension mismatch, using zero vector"
                );
                vec![0.0; dimension]
            }
            Err(e) => {
                warn!(provider = self.embedder.name(), error = %e, "Embedding failed, using zero vector");
                vec![0.0; dimension]
            }
        }
    }
}

/// Cosine similarity; 0 when lengths differ or either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

pub fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|x| *x == 0.0)
}

pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for val in vector.iter_mut() {
            *val /= magnitude;
        }
    }
    vector
}
