//! Memory-editing tools exposed only to the sleep-time scheduler's
//! secondary reasoning loop (spec §4.6): `vector_search`, `vector_memory_edit`,
//! `core_memory_edit`, and the sentinel `finish_edits`. Each wraps the
//! corresponding `aigent_memory::MemoryStore` operation; none of them are
//! registered in the foreground tool set.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use aigent_memory::MemoryStore;

use crate::{Tool, ToolOutput, ToolParam, ToolSpec};

pub struct VectorSearchTool {
    pub memory: Arc<MemoryStore>,
    pub top_n: usize,
    pub threshold: f32,
}

#[async_trait]
impl Tool for VectorSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "vector_search".to_string(),
            description: "Search vector memory blocks by semantic similarity to a query."
                .to_string(),
            params: vec![ToolParam::required("query", "Text to search for")],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let query = args.get("query").ok_or_else(|| anyhow!("missing required param: query"))?;
        let hits = self.memory.vector_search(query, self.top_n, self.threshold).await?;
        if hits.is_empty() {
            return Ok(ToolOutput { success: true, output: "no matching vector memory blocks".to_string() });
        }
        let mut out = String::new();
        for hit in &hits {
            out.push_str(&format!("{} (score {:.5}): {}\n", hit.label, hit.score, hit.content));
        }
        Ok(ToolOutput { success: true, output: out })
    }
}

pub struct VectorMemoryEditTool {
    pub memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for VectorMemoryEditTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "vector_memory_edit".to_string(),
            description: "Create or update a vector memory block, replacing old_text with new_text or appending new_text.".to_string(),
            params: vec![
                ToolParam::required("label", "Block label"),
                ToolParam::required("new_text", "Text to write"),
                ToolParam::optional("old_text", "Existing substring to replace"),
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let label = args.get("label").ok_or_else(|| anyhow!("missing required param: label"))?;
        let new_text = args.get("new_text").ok_or_else(|| anyhow!("missing required param: new_text"))?;
        let old_text = args.get("old_text").map(|s| s.as_str());
        match self.memory.edit_vector(label, new_text, old_text).await {
            Ok(()) => Ok(ToolOutput { success: true, output: format!("updated vector block '{label}'") }),
            Err(e) => Ok(ToolOutput { success: false, output: e.to_string() }),
        }
    }
}

pub struct CoreMemoryEditTool {
    pub memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for CoreMemoryEditTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "core_memory_edit".to_string(),
            description: "Update a core memory block, replacing old_text with new_text or appending new_text.".to_string(),
            params: vec![
                ToolParam::required("label", "Block label"),
                ToolParam::required("new_text", "Text to write"),
                ToolParam::optional("old_text", "Existing substring to replace"),
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let label = args.get("label").ok_or_else(|| anyhow!("missing required param: label"))?;
        let new_text = args.get("new_text").ok_or_else(|| anyhow!("missing required param: new_text"))?;
        let old_text = args.get("old_text").map(|s| s.as_str());
        match self.memory.edit_core(label, new_text, old_text).await {
            Ok(()) => Ok(ToolOutput { success: true, output: format!("updated core block '{label}'") }),
            Err(e) => Ok(ToolOutput { success: false, output: e.to_string() }),
        }
    }
}

/// Sentinel tool with no effect; the scheduler's reasoning loop treats a
/// call to it as the explicit termination signal for `process(task)`.
pub struct FinishEditsTool;

#[async_trait]
impl Tool for FinishEditsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "finish_edits".to_string(),
            description: "Call this when no further memory edits are needed this cycle.".to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolOutput> {
        Ok(ToolOutput { success: true, output: String::new() })
    }
}
