//! Core memory block persistence — one JSON file per label under `core_dir`.
//!
//! Labels are enumerated once at startup by listing the directory; creating
//! a new label is an administrative act (`create_label`), never something
//! the `edit` operation can do (spec §3).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aigent_config::AigentError;
use tracing::{info, warn};

use crate::block::MemoryBlock;

pub struct CoreMemoryStore {
    dir: PathBuf,
    blocks: BTreeMap<String, MemoryBlock>,
}

impl CoreMemoryStore {
    /// Load every `<label>.json` file found directly under `dir`. Missing
    /// directories are treated as an empty store (created lazily on write).
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, AigentError> {
        let dir = dir.as_ref().to_path_buf();
        let mut blocks = BTreeMap::new();

        if dir.exists() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| AigentError::storage(format!("reading core dir {}: {e}", dir.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| AigentError::storage(e.to_string()))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| AigentError::storage(format!("reading {}: {e}", path.display())))?;
                match serde_json::from_str::<MemoryBlock>(&raw) {
                    Ok(block) => {
                        blocks.insert(block.label.clone(), block);
                    }
                    Err(e) => warn!(path = %path.display(), %e, "skipping malformed core block file"),
                }
            }
        }

        info!(count = blocks.len(), dir = %dir.display(), "core memory blocks loaded");
        Ok(Self { dir, blocks })
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

    /// Administrative creation of a new label. Not reachable from the
    /// editing operation.
    pub fn create_label(&mut self, label: impl Into<String>, description: impl Into<String>, max_chars: usize) -> Result<(), AigentError> {
        let label = label.into();
        let block = MemoryBlock::new(label.clone(), description, max_chars);
        self.persist(&block)?;
        self.blocks.insert(label, block);
        Ok(())
    }

    /// §4.3.1 core memory edit: fails if the label does not exist or the
    /// resulting size would exceed `max_chars`. Persists and stamps
    /// `last_updated` only on success.
    pub fn edit(&mut self, label: &str, new_text: &str, old_text: Option<&str>) -> Result<(), AigentError> {
        let block = self.blocks.get_mut(label)
            .ok_or_else(|| AigentError::storage(format!("no core memory block labeled '{label}'")))?;
        block.apply_edit(new_text, old_text).map_err(AigentError::storage)?;
        let snapshot = block.clone();
        self.persist(&snapshot)
    }

    fn persist(&self, block: &MemoryBlock) -> Result<(), AigentError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AigentError::storage(format!("creating core dir: {e}")))?;
        let path = self.dir.join(format!("{}.json", block.label));
        let rendered = serde_json::to_string_pretty(block)
            .map_err(|e| AigentError::storage(format!("serializing core block: {e}")))?;
        std::fs::write(&path, rendered)
            .map_err(|e| AigentError::storage(format!("writing {}: {e}", path.display())))
    }
}
