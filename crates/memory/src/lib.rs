//! Tiered memory model: bounded core blocks, user-extensible vector blocks
//! with lazy embedding, and an append-only recall log.

pub mod block;
pub mod core_store;
pub mod embedding;
pub mod manager;
pub mod recall;
pub mod vector_store;

pub use block::{MemoryBlock, DEFAULT_MAX_CHARS};
pub use core_store::CoreMemoryStore;
pub use embedding::{cosine_similarity, EmbedFn, EmbedFuture};
pub use manager::{MemoryStore, VectorHit};
pub use recall::{RecallEntry, RecallLog};
pub use vector_store::{StoredEmbedding, VectorMemoryStore};
