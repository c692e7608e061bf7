//! Embedding collaborator contract and vector helpers
//!
//! Embeddings are produced outside the engine. This module defines the
//! `Embedder` trait the engine consumes, the boundary validation applied to
//! every vector before it reaches the store, and the similarity arithmetic
//! shared by matching and bootstrap evaluation.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{ReflexError, Result};

/// Expected embedding dimension (matches all-MiniLM-L6-v2 / gte-small)
pub const EMBEDDING_DIM: usize = 384;

/// Errors reported by an embedding service
#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("Embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("Inference failed: {0}")]
    InferenceError(String),

    #[error("Input rejected: {0}")]
    InvalidInput(String),
}

impl From<EmbedderError> for ReflexError {
    fn from(err: EmbedderError) -> Self {
        match err {
            EmbedderError::Unavailable(msg) => ReflexError::Unavailable(msg),
            other => ReflexError::Embedding(other.to_string()),
        }
    }
}

/// Result type for embedder operations
pub type EmbedderResult<T> = std::result::Result<T, EmbedderError>;

/// Trait for generating text embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>>;

    /// Generate embeddings for multiple texts in a batch
    ///
    /// Default implementation calls `embed` sequentially.
    async fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Returns the dimensionality of generated embeddings
    fn dimensions(&self) -> usize;
}

/// Reject malformed embeddings before anything is written or queried
pub fn validate_embedding(embedding: &[f32]) -> Result<()> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(ReflexError::InvalidArgument(format!(
            "Invalid embedding dimension: expected {EMBEDDING_DIM}, got {}",
            embedding.len()
        )));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(ReflexError::InvalidArgument(
            "embedding contains non-finite values".into(),
        ));
    }
    if embedding.iter().all(|x| *x == 0.0) {
        return Err(ReflexError::InvalidArgument(
            "embedding has zero norm".into(),
        ));
    }
    Ok(())
}

/// Cosine similarity between two embedding vectors
///
/// Returns a value in [-1, 1] where 1 means identical direction. Vectors of
/// different length or zero norm have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
    }
}

/// Stable content fingerprint of an embedding (hex SHA-256 of its bytes)
pub fn fingerprint(embedding: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for value in embedding {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
