//! `MemoryStore` — the façade tying core blocks, vector blocks, the recall
//! log, and the embedding provider together behind the operations §4.3
//! describes. Concurrent writers to the same label are serialized by a
//! per-label async mutex; different labels may be edited concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use aigent_config::AigentError;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::core_store::CoreMemoryStore;
use crate::embedding::{cosine_similarity, EmbedFn};
use crate::recall::RecallLog;
use crate::vector_store::VectorMemoryStore;

pub struct VectorHit {
    pub label: String,
    pub content: String,
    pub score: f32,
}

pub struct MemoryStore {
    core: Mutex<CoreMemoryStore>,
    vector: Mutex<VectorMemoryStore>,
    recall: RecallLog,
    label_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    embed_fn: EmbedFn,
}

impl MemoryStore {
    pub fn new(core: CoreMemoryStore, vector: VectorMemoryStore, recall: RecallLog, embed_fn: EmbedFn) -> Self {
        Self {
            core: Mutex::new(core),
            vector: Mutex::new(vector),
            recall,
            label_locks: Mutex::new(HashMap::new()),
            embed_fn,
        }
    }

    async fn lock_for(&self, label: &str) -> Arc<Mutex<()>> {
        let mut locks = self.label_locks.lock().await;
        locks.entry(label.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn edit_core(&self, label: &str, new_text: &str, old_text: Option<&str>) -> Result<(), AigentError> {
        let lock = self.lock_for(label).await;
        let _guard = lock.lock().await;
        let mut core = self.core.lock().await;
        core.edit(label, new_text, old_text)
    }

    pub async fn edit_vector(&self, label: &str, new_text: &str, old_text: Option<&str>) -> Result<(), AigentError> {
        let lock = self.lock_for(label).await;
        let _guard = lock.lock().await;
        let mut vector = self.vector.lock().await;
        vector.edit(label, new_text, old_text)
    }

    /// §4.3.3: embeds every vector block whose label is missing from the
    /// embedding cache set.
    pub async fn embed_all(&self) -> Result<(), AigentError> {
        let stale: Vec<(String, String)> = {
            let vector = self.vector.lock().await;
            vector.stale_labels().into_iter()
                .filter_map(|label| vector.get(&label).map(|b| (label, b.content.clone())))
                .collect()
        };
        for (label, content) in stale {
            let vec = (self.embed_fn)(content).await?;
            let mut vector = self.vector.lock().await;
            vector.store_embedding(&label, vec)?;
        }
        Ok(())
    }

    /// §4.3.4: refreshes stale embeddings, embeds the query, scores every
    /// block, drops below-threshold hits, and returns the top `top_n` sorted
    /// descending by score with ties broken by ascending label.
    pub async fn vector_search(&self, query: &str, top_n: usize, threshold: f32) -> Result<Vec<VectorHit>, AigentError> {
        self.embed_all().await?;
        if top_n == 0 {
            return Ok(vec![]);
        }
        let query_vec = (self.embed_fn)(query.to_string()).await?;

        let vector = self.vector.lock().await;
        let mut hits: Vec<VectorHit> = vector.all()
            .filter_map(|block| {
                vector.embedding(&block.label).map(|emb| VectorHit {
                    label: block.label.clone(),
                    content: block.content.clone(),
                    score: cosine_similarity(&query_vec, &emb.vector),
                })
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });
        hits.truncate(top_n);
        Ok(hits)
    }

    pub fn recall_append(&self, role: &str, content: &str) -> Result<u64, AigentError> {
        self.recall.append(role, content)
    }

    pub fn conversation_search(&self, query: &str, n_neighbors: u64, limit: usize) -> Result<Vec<(String, String)>, AigentError> {
        Ok(self.recall.conversation_search(query, n_neighbors, limit)?
            .into_iter()
            .map(|e| (e.role, e.content))
            .collect())
    }

    /// §4.3.6: a section-structured textual report. `exclude` containing
    /// `"vect"` suppresses the vector section; `"rec"` or `"conv"`
    /// suppresses the recall section.
    pub async fn memory_search(&self, query: &str, n_neighbors: u64, top_n: usize, exclude: &str) -> Result<String, AigentError> {
        let exclude_lower = exclude.to_lowercase();
        let include_vector = !exclude_lower.contains("vect");
        let include_recall = !exclude_lower.contains("rec") && !exclude_lower.contains("conv");

        let vector_hits = if include_vector {
            self.vector_search(query, top_n, 0.4).await?
        } else {
            vec![]
        };
        let recall_hits = if include_recall {
            self.conversation_search(query, n_neighbors, 1)?
        } else {
            vec![]
        };

        if vector_hits.is_empty() && recall_hits.is_empty() {
            return Ok(format!("Memory search for \"{query}\": no results."));
        }

        let mut report = format!("Memory search for \"{query}\":\n");
        if include_vector && !vector_hits.is_empty() {
            report.push_str("\n[vector memory]\n");
            for hit in &vector_hits {
                report.push_str(&format!("- {} (score {:.5}): {}\n", hit.label, hit.score, hit.content));
            }
        }
        if include_recall && !recall_hits.is_empty() {
            report.push_str("\n[recall log]\n");
            for (role, content) in &recall_hits {
                report.push_str(&format!("- {role}: {content}\n"));
            }
        }
        Ok(report)
    }

    /// §4.3.7: a structured textual view concatenated with the system prompt
    /// on every chat turn.
    pub async fn snapshot(&self) -> String {
        let core = self.core.lock().await;
        let vector = self.vector.lock().await;

        let newest = core.all().map(|b| b.last_updated)
            .chain(vector.all().map(|b| b.last_updated))
            .max();
        let vector_labels: Vec<String> = vector.labels();

        let mut out = String::new();
        out.push_str("<memory_metadata>\n");
        out.push_str(&format!("Current time: {}\n", Utc::now().to_rfc3339()));
        if let Some(newest) = newest {
            out.push_str(&format!("Most recently updated: {}\n", newest.to_rfc3339()));
        }
        out.push_str(&format!("{} total memories\n", vector_labels.len()));
        if !vector_labels.is_empty() {
            out.push_str(&format!("Vector memory blocks: {}\n", vector_labels.join(", ")));
        }
        out.push_str("</memory_metadata>\n");

        for block in core.all() {
            out.push_str(&format!("<{}>\n", block.label));
            out.push_str(&format!("description: {}\n", block.description));
            out.push_str(&format!("chars: {}/{}\n", block.current_chars, block.max_chars));
            out.push_str(&block.content);
            out.push('\n');
            out.push_str(&format!("</{}>\n", block.label));
        }

        out
    }
}
