//! Context manager (spec §4.4): token estimation and oldest-first trimming
//! against a token budget with a system-prompt reservation.
//!
//! Pure functions, no I/O — grounded on the original prototype's
//! `trim_context` (oldest-first drop, system-message token reservation).

use aigent_llm::ChatMessage;

/// `⌈len(text) / 4⌉` — a crude but stable token estimate used throughout
/// the context manager and the sleep scheduler's private-context trimming.
pub fn token_estimate(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn message_tokens(message: &ChatMessage) -> usize {
    token_estimate(&message.serialize_for_estimate())
}

/// Trim `messages` from the oldest entry until the remainder fits in
/// `max_tokens - tokens(system_messages)`, or until nothing is left.
///
/// Returns `(kept, trimmed)` such that `trimmed ++ kept == messages` in
/// original order, with `trimmed` holding the oldest-first-removed prefix.
/// Invariant: on return, either `kept` fits the budget or `kept` is empty.
pub fn trim(
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    system_messages: &[ChatMessage],
) -> (Vec<ChatMessage>, Vec<ChatMessage>) {
    let system_tokens: usize = system_messages.iter().map(message_tokens).sum();
    let available = max_tokens.saturating_sub(system_tokens);

    let mut kept: Vec<ChatMessage> = messages;
    let mut trimmed: Vec<ChatMessage> = Vec::new();

    let mut total: usize = kept.iter().map(message_tokens).sum();
    while total > available && !kept.is_empty() {
        let removed = kept.remove(0);
        total -= message_tokens(&removed);
        trimmed.push(removed);
    }

    (kept, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(token_estimate("abcd"), 1);
        assert_eq!(token_estimate("abcde"), 2);
        assert_eq!(token_estimate(""), 0);
    }

    #[test]
    fn trim_keeps_everything_within_budget() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let (kept, trimmed) = trim(messages.clone(), 1000, &[]);
        assert_eq!(kept.len(), 2);
        assert!(trimmed.is_empty());
    }

    #[test]
    fn trim_drops_oldest_first_scenario_s2() {
        // 100 user turns of 500 chars; max_tokens=2000; system reserves 100 tokens.
        let messages: Vec<ChatMessage> = (0..100)
            .map(|i| ChatMessage::user(format!("{i:03}-{}", "x".repeat(497))))
            .collect();
        let system = vec![ChatMessage::system("s".repeat(400))]; // ~100 tokens
        let (kept, trimmed) = trim(messages.clone(), 2000, &system);

        assert!(!trimmed.is_empty());
        // kept fits the remaining budget.
        let kept_tokens: usize = kept.iter().map(message_tokens).sum();
        assert!(kept_tokens <= 1900);
        // trimmed is the oldest-first prefix of the original sequence.
        assert_eq!(trimmed, messages[..trimmed.len()]);
        assert_eq!(kept, messages[trimmed.len()..]);
    }

    #[test]
    fn trim_returns_empty_kept_when_single_message_exceeds_budget() {
        let messages = vec![ChatMessage::user("x".repeat(10_000))];
        let (kept, trimmed) = trim(messages, 10, &[]);
        assert!(kept.is_empty());
        assert_eq!(trimmed.len(), 1);
    }

    #[test]
    fn trim_preserves_concatenation_order() {
        let messages: Vec<ChatMessage> = (0..5).map(|i| ChatMessage::user(format!("msg{i}"))).collect();
        let (kept, trimmed) = trim(messages.clone(), 3, &[]);
        let mut recombined = trimmed.clone();
        recombined.extend(kept.clone());
        assert_eq!(recombined.len(), messages.len());
    }
}
