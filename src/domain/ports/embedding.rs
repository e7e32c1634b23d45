//! Embedding port for action-similarity vectors.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;

/// Port interface for the embedding model backing the vector cache and
/// grounding matcher.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;

    /// Embed `text` into a dense vector. Implementations return
    /// unit-normalized vectors so cosine similarity reduces to a dot
    /// product.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Normalize a vector to unit length in place. Zero vectors are left
/// untouched.
pub fn unit_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two unit vectors; 0.0 when dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Deterministic, dependency-free embedding for tests: hashes character
/// trigrams into a fixed-dimension bag and normalizes. Similar texts get
/// similar vectors, unrelated texts do not.
#[derive(Debug, Clone)]
pub struct TrigramEmbeddingClient {
    dimension: usize,
}

impl Default for TrigramEmbeddingClient {
    fn default() -> Self {
        Self { dimension: 256 }
    }
}

impl TrigramEmbeddingClient {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let normalized: String = text.to_lowercase();
        let chars: Vec<char> = normalized.chars().collect();
        if chars.is_empty() {
            return vector;
        }
        for window in chars.windows(3.min(chars.len()).max(1)) {
            let mut hash: u64 = 1469598103934665603;
            for ch in window {
                hash ^= *ch as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        unit_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingClient for TrigramEmbeddingClient {
    fn name(&self) -> &'static str {
        "trigram"
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}
