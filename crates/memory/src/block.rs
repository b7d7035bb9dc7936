//! Core and vector memory block types (spec §3).
//!
//! Both block kinds share a shape — `label`, `description`, `content`, and
//! size metadata — but differ in lifecycle: core block labels are fixed at
//! startup (new ones are an administrative act, not an editing operation);
//! vector block labels are user-extensible and each carries an optional
//! embedding artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHARS: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub label: String,
    pub description: String,
    pub content: String,
    pub last_updated: DateTime<Utc>,
    pub current_chars: usize,
    pub max_chars: usize,
}

impl MemoryBlock {
    pub fn new(label: impl Into<String>, description: impl Into<String>, max_chars: usize) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            content: String::new(),
            last_updated: Utc::now(),
            current_chars: 0,
            max_chars,
        }
    }

    fn recompute_len(&mut self) {
        self.current_chars = self.content.chars().count();
    }

    /// Apply an edit per the spec's replace/append rule. Returns `Err` with a
    /// descriptive message (and leaves `self` untouched) when the result
    /// would exceed `max_chars`; never partially applies an edit.
    pub fn apply_edit(&mut self, new_text: &str, old_text: Option<&str>) -> Result<(), String> {
        let candidate = match old_text {
            Some(old) if !old.is_empty() && self.content.contains(old) => {
                self.content.replace(old, new_text)
            }
            _ => {
                if self.content.is_empty() {
                    new_text.to_string()
                } else {
                    format!("{} {}", self.content, new_text)
                }
            }
        };

        let candidate_len = candidate.chars().count();
        if candidate_len > self.max_chars {
            return Err(format!(
                "edit to '{}' would grow content to {} chars, exceeding the {}-char limit",
                self.label, candidate_len, self.max_chars
            ));
        }

        self.content = candidate;
        self.recompute_len();
        self.last_updated = Utc::now();
        Ok(())
    }
}
