//! Offline embedding: hashed bag of words

use super::{Embedder, normalize};
use crate::error::Result;
use async_trait::async_trait;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Hashes lowercase tokens into `dimension` buckets.
///
/// The hash is FNV-1a so vectors stay identical across runs and toolchains.
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn create_embedding(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];

        for token in tokenize(text) {
            let idx = (fnv1a(&token) % self.dimension as u64) as usize;
            embedding[idx] += 1.0;
        }

        normalize(embedding)
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn name(&self) -> &str {
        "hashed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.create_embedding(text))
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}
