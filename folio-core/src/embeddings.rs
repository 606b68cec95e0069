//! Pluggable embedding providers for query and chunk vectorization.
//!
//! Provides a trait-based abstraction over embedding models, with a local
//! hashed term-frequency embedder (always available) and FastEmbed (optional,
//! behind the `semantic-search` feature). FastEmbed runs the same
//! sentence-transformer models the collection was built with, so query
//! vectors line up with the stored ones.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EmbedError;

/// Trait for embedding providers.
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Generate embeddings for a batch of texts.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the model name reported by `/health`.
    fn model_name(&self) -> &str;
}

/// Configuration for embedding providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "local" or "fastembed".
    pub provider: String,
    /// Sentence-transformer model name.
    pub model: String,
    /// Dimensions for the local embedder.
    pub dimensions: usize,
    /// Batch size for bulk embedding during ingest.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "fastembed".into(),
            model: "all-MiniLM-L6-v2".into(),
            dimensions: 384,
            batch_size: 32,
        }
    }
}

/// Local hashed term-frequency embedder.
///
/// Deterministic and dependency-free. Texts sharing vocabulary land close
/// together, which is enough for tests and for stores built with this same
/// embedder, but not for collections built with a neural model.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
    name: String,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            name: format!("local-tf-{}", dimensions.max(1)),
        }
    }
}

/// djb2.
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if words.is_empty() {
            return Ok(vector);
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// FastEmbed embedder (behind `semantic-search` feature flag).
/// Uses the `fastembed` crate with local ONNX models.
#[cfg(feature = "semantic-search")]
pub struct FastEmbedder {
    model: fastembed::TextEmbedding,
    name: String,
    dims: usize,
}

#[cfg(feature = "semantic-search")]
impl FastEmbedder {
    pub fn new(model_name: &str) -> Result<Self, EmbedError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model_enum = match model_name {
            "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
                EmbeddingModel::AllMiniLML6V2
            }
            "all-MiniLM-L12-v2" | "sentence-transformers/all-MiniLM-L12-v2" => {
                EmbeddingModel::AllMiniLML12V2
            }
            "bge-small-en-v1.5" | "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" | "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            other => {
                return Err(EmbedError::Init {
                    model: other.to_string(),
                    message: "model is not supported by fastembed".to_string(),
                });
            }
        };

        let model = TextEmbedding::try_new(InitOptions {
            model_name: model_enum,
            show_download_progress: false,
            ..Default::default()
        })
        .map_err(|e| EmbedError::Init {
            model: model_name.to_string(),
            message: e.to_string(),
        })?;

        // Detect dimensions from a probe embedding
        let probe = model
            .embed(vec!["probe"], None)
            .map_err(|e| EmbedError::Init {
                model: model_name.to_string(),
                message: e.to_string(),
            })?;
        let dims = probe.first().map(|v| v.len()).unwrap_or(384);

        Ok(Self {
            model,
            name: model_name.to_string(),
            dims,
        })
    }
}

#[cfg(feature = "semantic-search")]
impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.model
            .embed(vec![text], None)
            .map_err(|e| EmbedError::Inference {
                message: e.to_string(),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Inference {
                message: "model returned no embedding".to_string(),
            })
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedError::Inference {
                message: e.to_string(),
            })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Factory function to create an embedder based on configuration.
///
/// Never fails: a provider that cannot be initialized falls back to the
/// local embedder with a warning, so the service still starts.
pub fn create_embedder(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        #[cfg(feature = "semantic-search")]
        "fastembed" => match FastEmbedder::new(&config.model) {
            Ok(embedder) => {
                tracing::info!(
                    model = config.model.as_str(),
                    dims = embedder.dimensions(),
                    "Loaded FastEmbed model"
                );
                Arc::new(embedder)
            }
            Err(e) => {
                tracing::warn!("Failed to initialize embedding function: {}, falling back to local", e);
                Arc::new(LocalEmbedder::new(config.dimensions))
            }
        },
        #[cfg(not(feature = "semantic-search"))]
        "fastembed" => {
            tracing::warn!(
                model = config.model.as_str(),
                "FastEmbed requested but 'semantic-search' feature is not enabled, falling back to local"
            );
            Arc::new(LocalEmbedder::new(config.dimensions))
        }
        "local" => Arc::new(LocalEmbedder::new(config.dimensions)),
        other => {
            tracing::warn!("Unknown embedding provider '{}', falling back to local", other);
            Arc::new(LocalEmbedder::new(config.dimensions))
        }
    }
}

/// Cosine similarity of two vectors; 0.0 when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
