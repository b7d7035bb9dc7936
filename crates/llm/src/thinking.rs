//! Splits a raw text-delta stream containing `<think>…</think>` markers into
//! typed [`StreamChunk::Thinking`] / [`StreamChunk::Content`] pieces.
//!
//! Grounded on the llama-cpp provider's `generate_streaming_with_thinking`
//! state machine: the OAI-compat wire format interleaves reasoning and
//! content in one text channel, tagged by literal `<think>`/`</think>`
//! markers that must never leak into what the consumer sees. A marker may
//! straddle two network reads, so the splitter buffers a short tail of
//! undecided text between `feed` calls rather than scanning each chunk in
//! isolation.

use crate::StreamChunk;

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Default)]
pub struct ThinkSplitter {
    in_thinking: bool,
    /// Carries a possible partial tag across `feed` calls.
    pending: String,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next raw text delta; returns zero or more chunks that are
    /// now safe to emit.
    pub fn feed(&mut self, delta: &str) -> Vec<StreamChunk> {
        self.pending.push_str(delta);
        let mut out = Vec::new();

        loop {
            let tag = if self.in_thinking { CLOSE_TAG } else { OPEN_TAG };
            match self.pending.find(tag) {
                Some(idx) => {
                    let before = self.pending[..idx].to_string();
                    if !before.is_empty() {
                        out.push(wrap(self.in_thinking, before));
                    }
                    self.pending.drain(..idx + tag.len());
                    self.in_thinking = !self.in_thinking;
                }
                None => {
                    // No full tag yet. Hold back a suffix that could be the
                    // start of a tag straddling the next read; flush the rest.
                    let hold_back = longest_tag_prefix_suffix(&self.pending, tag);
                    let emit_len = self.pending.len() - hold_back;
                    if emit_len > 0 {
                        let emit_len = floor_char_boundary(&self.pending, emit_len);
                        if emit_len > 0 {
                            let text = self.pending[..emit_len].to_string();
                            out.push(wrap(self.in_thinking, text));
                            self.pending.drain(..emit_len);
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Flush any remaining buffered text at stream end (an unterminated
    /// `<think>` segment is still surfaced rather than dropped).
    pub fn flush(&mut self) -> Vec<StreamChunk> {
        if self.pending.is_empty() {
            return vec![];
        }
        let text = std::mem::take(&mut self.pending);
        vec![wrap(self.in_thinking, text)]
    }
}

fn wrap(in_thinking: bool, text: String) -> StreamChunk {
    if in_thinking {
        StreamChunk::Thinking(text)
    } else {
        StreamChunk::Content(text)
    }
}

/// Largest suffix length of `buf` that is a proper, non-empty prefix of `tag`
/// (i.e. could still grow into `tag` on the next `feed`).
fn longest_tag_prefix_suffix(buf: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if buf.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pieces: &[&str]) -> Vec<StreamChunk> {
        let mut splitter = ThinkSplitter::new();
        let mut out = Vec::new();
        for piece in pieces {
            out.extend(splitter.feed(piece));
        }
        out.extend(splitter.flush());
        out
    }

    #[test]
    fn plain_content_passes_through() {
        let out = run(&["hello world"]);
        assert_eq!(out, vec![StreamChunk::Content("hello world".to_string())]);
    }

    #[test]
    fn splits_thinking_from_content() {
        let out = run(&["<think>reasoning</think>answer"]);
        assert_eq!(out, vec![
            StreamChunk::Thinking("reasoning".to_string()),
            StreamChunk::Content("answer".to_string()),
        ]);
    }

    #[test]
    fn never_leaks_raw_tag_text() {
        let out = run(&["<think>secret</think>public"]);
        for chunk in &out {
            let text = match chunk {
                StreamChunk::Content(s) | StreamChunk::Thinking(s) => s,
                _ => continue,
            };
            assert!(!text.contains("<think>"));
            assert!(!text.contains("</think>"));
        }
    }

    #[test]
    fn handles_tag_straddling_two_reads() {
        let out = run(&["<thi", "nk>reasoning<", "/think>done"]);
        assert_eq!(out, vec![
            StreamChunk::Thinking("reasoning".to_string()),
            StreamChunk::Content("done".to_string()),
        ]);
    }

    #[test]
    fn unterminated_thinking_segment_is_still_surfaced() {
        let out = run(&["<think>never closes"]);
        assert_eq!(out, vec![StreamChunk::Thinking("never closes".to_string())]);
    }

    #[test]
    fn multiple_thinking_segments_interleave_with_content() {
        let out = run(&["a<think>t1</think>b<think>t2</think>c"]);
        assert_eq!(out, vec![
            StreamChunk::Content("a".to_string()),
            StreamChunk::Thinking("t1".to_string()),
            StreamChunk::Content("b".to_string()),
            StreamChunk::Thinking("t2".to_string()),
            StreamChunk::Content("c".to_string()),
        ]);
    }
}
