//! Append-only recall log — the full conversation transcript, searchable by
//! case-insensitive substring with neighbor-expansion windowing (spec §3,
//! Open Question 4: redb has no full-text index and none of the trimmed
//! dependencies add one, so substring matching is the permanent behavior,
//! not a placeholder).

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

use aigent_config::AigentError;

const TABLE: TableDefinition<u64, &str> = TableDefinition::new("recall_log");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

pub struct RecallLog {
    db: Database,
}

impl RecallLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AigentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AigentError::storage(format!("creating recall dir: {e}")))?;
        }
        let db = Database::create(path)
            .map_err(|e| AigentError::storage(format!("opening recall log {}: {e}", path.display())))?;
        {
            // Ensure the table exists even on a freshly created database.
            let txn = db.begin_write().map_err(|e| AigentError::storage(e.to_string()))?;
            {
                txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
            }
            txn.commit().map_err(|e| AigentError::storage(e.to_string()))?;
        }
        Ok(Self { db })
    }

    fn next_seq(&self) -> Result<u64, AigentError> {
        let txn = self.db.begin_read().map_err(|e| AigentError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
        match table.iter().map_err(|e| AigentError::storage(e.to_string()))?.next_back() {
            Some(entry) => {
                let (k, _) = entry.map_err(|e| AigentError::storage(e.to_string()))?;
                Ok(k.value() + 1)
            }
            None => Ok(1),
        }
    }

    /// Appends a turn to the log and returns its sequence number.
    pub fn append(&self, role: &str, content: &str) -> Result<u64, AigentError> {
        let seq = self.next_seq()?;
        let entry = RecallEntry { seq, timestamp: Utc::now(), role: role.to_string(), content: content.to_string() };
        let rendered = serde_json::to_string(&entry)
            .map_err(|e| AigentError::storage(format!("serializing recall entry: {e}")))?;

        let txn = self.db.begin_write().map_err(|e| AigentError::storage(e.to_string()))?;
        {
            let mut table = txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
            table.insert(seq, rendered.as_str()).map_err(|e| AigentError::storage(e.to_string()))?;
        }
        txn.commit().map_err(|e| AigentError::storage(e.to_string()))?;
        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Result<Option<RecallEntry>, AigentError> {
        let txn = self.db.begin_read().map_err(|e| AigentError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
        match table.get(seq).map_err(|e| AigentError::storage(e.to_string()))? {
            Some(value) => {
                let entry: RecallEntry = serde_json::from_str(value.value())
                    .map_err(|e| AigentError::storage(format!("decoding recall entry: {e}")))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> Result<u64, AigentError> {
        let txn = self.db.begin_read().map_err(|e| AigentError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
        Ok(table.len().map_err(|e| AigentError::storage(e.to_string()))?)
    }

    pub fn is_empty(&self) -> Result<bool, AigentError> {
        Ok(self.len()? == 0)
    }

    fn all_entries(&self) -> Result<Vec<RecallEntry>, AigentError> {
        let txn = self.db.begin_read().map_err(|e| AigentError::storage(e.to_string()))?;
        let table = txn.open_table(TABLE).map_err(|e| AigentError::storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in table.iter().map_err(|e| AigentError::storage(e.to_string()))? {
            let (_, value) = row.map_err(|e| AigentError::storage(e.to_string()))?;
            let entry: RecallEntry = serde_json::from_str(value.value())
                .map_err(|e| AigentError::storage(format!("decoding recall entry: {e}")))?;
            out.push(entry);
        }
        Ok(out)
    }

    /// Case-insensitive substring search with neighbor-expansion windowing.
    /// Locates up to `limit` matching rows, most-recent-first, then each
    /// match at sequence `m` pulls in `[max(1, m - before), m + after]`
    /// where `after = n_neighbors / 2` (floor) and `before = n_neighbors -
    /// after`. Overlapping windows are merged and the result is returned in
    /// sequence order with no duplicate entries.
    pub fn conversation_search(&self, query: &str, n_neighbors: u64, limit: usize) -> Result<Vec<RecallEntry>, AigentError> {
        let mut entries = self.all_entries()?;
        if entries.is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        let needle = query.to_lowercase();
        let after = n_neighbors / 2;
        let before = n_neighbors - after;

        // Most-recent-first for the match selection, capped at `limit`.
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        let matches: Vec<u64> = entries.iter()
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .take(limit)
            .map(|e| e.seq)
            .collect();
        entries.sort_by(|a, b| a.seq.cmp(&b.seq));

        let mut ranges: Vec<(u64, u64)> = matches.into_iter()
            .map(|seq| (seq.saturating_sub(before).max(1), seq + after))
            .collect();
        ranges.sort_unstable();

        let merged = merge_ranges(ranges.drain(..).collect());
        let mut out = Vec::new();
        for entry in entries {
            if merged.iter().any(|(lo, hi)| entry.seq >= *lo && entry.seq <= *hi) {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

fn merge_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (lo, hi) in ranges {
        match merged.last_mut() {
            Some((_, last_hi)) if lo <= *last_hi + 1 => {
                *last_hi = (*last_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}
