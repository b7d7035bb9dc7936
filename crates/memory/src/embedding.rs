//! Embedding plumbing for vector memory search.
//!
//! The memory crate has no opinion on which provider produces an embedding;
//! callers hand in an `EmbedFn` (typically backed by `aigent-llm`'s Ollama
//! client hitting `embed_model`) and everything downstream — caching,
//! invalidation, cosine scoring — is provider-agnostic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use aigent_config::AigentError;

pub type EmbedFuture = Pin<Box<dyn Future<Output = Result<Vec<f32>, AigentError>> + Send>>;

/// `Arc<dyn Fn>` rather than a trait object behind a trait: embedding is a
/// single async operation, so a boxed closure is enough and keeps callers
/// from having to define a one-method trait impl.
pub type EmbedFn = Arc<dyn Fn(String) -> EmbedFuture + Send + Sync>;

/// Cosine similarity between two equal-length vectors, rounded to 5 decimal
/// places to keep scores stable for sorting and test assertions. Returns
/// `0.0` for a zero-length vector or length mismatch rather than panicking.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a * norm_b);
    (score * 100_000.0).round() / 100_000.0
}
