//! Vector memory block persistence — user-extensible labels under
//! `vector_dir`, each with a lazily-computed embedding sidecar and a
//! durable embedding cache set recording which labels are fresh.
//!
//! Unlike core blocks, editing a vector block creates it if the label does
//! not yet exist (spec §4.3.2), always with `max_chars = DEFAULT_MAX_CHARS`.
//! An edit invalidates any previously-computed embedding for that label by
//! deleting the sidecar file and dropping the label from the cache set;
//! re-embedding happens lazily the next time the sleep agent calls
//! `embed_all`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use aigent_config::AigentError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::block::{MemoryBlock, DEFAULT_MAX_CHARS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub label: String,
    pub vector: Vec<f32>,
}

pub struct VectorMemoryStore {
    dir: PathBuf,
    cache_path: PathBuf,
    blocks: BTreeMap<String, MemoryBlock>,
    embeddings: BTreeMap<String, StoredEmbedding>,
    /// Durable set of labels whose embedding is known fresh (spec §3
    /// "Embedding cache set"), persisted as a single JSON array at
    /// `cache_path` — separate from the per-label `.embedding.json`
    /// sidecars, which hold the vectors themselves.
    fresh: BTreeSet<String>,
}

impl VectorMemoryStore {
    /// Loads vector blocks and embedding sidecars from `dir`, and the
    /// durable embedding-cache-set file from `dir/.embedding_cache.json`.
    /// Use [`Self::load_with_cache`] to point the cache-set file elsewhere
    /// (e.g. at a configured `storage.cache_file`).
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, AigentError> {
        let dir = dir.as_ref().to_path_buf();
        let cache_path = dir.join(".embedding_cache.json");
        Self::load_with_cache(dir, cache_path)
    }

    pub fn load_with_cache(dir: impl AsRef<Path>, cache_path: impl AsRef<Path>) -> Result<Self, AigentError> {
        let dir = dir.as_ref().to_path_buf();
        let cache_path = cache_path.as_ref().to_path_buf();
        let mut blocks = BTreeMap::new();
        let mut embeddings = BTreeMap::new();

        if dir.exists() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| AigentError::storage(format!("reading vector dir {}: {e}", dir.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| AigentError::storage(e.to_string()))?;
                let path = entry.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                if let Some(label) = name.strip_suffix(".embedding.json") {
                    let raw = std::fs::read_to_string(&path)
                        .map_err(|e| AigentError::storage(format!("reading {}: {e}", path.display())))?;
                    if let Ok(embedding) = serde_json::from_str::<StoredEmbedding>(&raw) {
                        embeddings.insert(label.to_string(), embedding);
                    }
                } else if name.ends_with(".json") {
                    let raw = std::fs::read_to_string(&path)
                        .map_err(|e| AigentError::storage(format!("reading {}: {e}", path.display())))?;
                    if let Ok(block) = serde_json::from_str::<MemoryBlock>(&raw) {
                        blocks.insert(block.label.clone(), block);
                    }
                }
            }
        }

        let fresh = if cache_path.exists() {
            let raw = std::fs::read_to_string(&cache_path)
                .map_err(|e| AigentError::storage(format!("reading {}: {e}", cache_path.display())))?;
            serde_json::from_str::<BTreeSet<String>>(&raw)
                .map_err(|e| AigentError::storage(format!("parsing {}: {e}", cache_path.display())))?
        } else {
            BTreeSet::new()
        };

        info!(count = blocks.len(), dir = %dir.display(), "vector memory blocks loaded");
        Ok(Self { dir, cache_path, blocks, embeddings, fresh })
    }

    fn persist_cache_set(&self) -> Result<(), AigentError> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AigentError::storage(format!("creating {}: {e}", parent.display())))?;
        }
        let rendered = serde_json::to_string_pretty(&self.fresh)
            .map_err(|e| AigentError::storage(format!("serializing embedding cache set: {e}")))?;
        std::fs::write(&self.cache_path, rendered)
            .map_err(|e| AigentError::storage(format!("writing {}: {e}", self.cache_path.display())))
    }

    /// Clears the whole durable embedding cache set (spec §3: "the whole
    /// set may be cleared"), forcing every block to re-embed on next search.
    pub fn clear_cache(&mut self) -> Result<(), AigentError> {
        self.fresh.clear();
        self.persist_cache_set()
    }

    pub fn labels(&self) -> Vec<String> {
        self.blocks.keys().cloned().collect()
    }

    pub fn get(&self, label: &str) -> Option<&MemoryBlock> {
        self.blocks.get(label)
    }

    pub fn all(&self) -> impl Iterator<Item = &MemoryBlock> {
        self.blocks.values()
    }

    pub fn embedding(&self, label: &str) -> Option<&StoredEmbedding> {
        self.embeddings.get(label)
    }

    /// Labels whose embedding artifact is missing, or whose label is not in
    /// the durable embedding cache set (spec §3 invariant: an artifact only
    /// corresponds to current content when its label is also in the set).
    pub fn stale_labels(&self) -> Vec<String> {
        self.blocks.keys()
            .filter(|label| !self.embeddings.contains_key(*label) || !self.fresh.contains(*label))
            .cloned()
            .collect()
    }

    pub fn store_embedding(&mut self, label: &str, vector: Vec<f32>) -> Result<(), AigentError> {
        let embedding = StoredEmbedding { label: label.to_string(), vector };
        self.persist_embedding(&embedding)?;
        self.embeddings.insert(label.to_string(), embedding);
        self.fresh.insert(label.to_string());
        self.persist_cache_set()?;
        Ok(())
    }

    /// §4.3.2 vector memory edit: creates the label on first use, otherwise
    /// applies the shared replace/append rule. Invalidates the cached
    /// embedding for this label on any successful edit.
    pub fn edit(&mut self, label: &str, new_text: &str, old_text: Option<&str>) -> Result<(), AigentError> {
        let block = self.blocks.entry(label.to_string())
            .or_insert_with(|| MemoryBlock::new(label, "", DEFAULT_MAX_CHARS));
        block.apply_edit(new_text, old_text).map_err(AigentError::storage)?;
        let snapshot = block.clone();
        self.persist_block(&snapshot)?;
        self.invalidate_embedding(label)?;
        Ok(())
    }

    fn invalidate_embedding(&mut self, label: &str) -> Result<(), AigentError> {
        self.embeddings.remove(label);
        self.fresh.remove(label);
        self.persist_cache_set()?;
        let path = self.embedding_path(label);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| AigentError::storage(format!("removing stale embedding {}: {e}", path.display())))?;
        }
        Ok(())
    }

    fn block_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.json"))
    }

    fn embedding_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.embedding.json"))
    }

    fn persist_block(&self, block: &MemoryBlock) -> Result<(), AigentError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AigentError::storage(format!("creating vector dir: {e}")))?;
        let path = self.block_path(&block.label);
        let rendered = serde_json::to_string_pretty(block)
            .map_err(|e| AigentError::storage(format!("serializing vector block: {e}")))?;
        std::fs::write(&path, rendered)
            .map_err(|e| AigentError::storage(format!("writing {}: {e}", path.display())))
    }

    fn persist_embedding(&self, embedding: &StoredEmbedding) -> Result<(), AigentError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AigentError::storage(format!("creating vector dir: {e}")))?;
        let path = self.embedding_path(&embedding.label);
        let rendered = serde_json::to_string_pretty(embedding)
            .map_err(|e| AigentError::storage(format!("serializing embedding: {e}")))?;
        std::fs::write(&path, rendered)
            .map_err(|e| AigentError::storage(format!("writing {}: {e}", path.display())))
    }
}
