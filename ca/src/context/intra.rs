//! Intra-phase context compression
//!
//! Tier 0: the last W turns ride at full fidelity. Tier 1: older tool
//! results are masked down to a placeholder that preserves role, id, size
//! and hash; older assistant tool-call turns collapse to a call list; older
//! reasoning is truncated. Messages carrying error markers are always kept
//! whole. Tier 2 rebuilds context from scratch for loop_until retries.
//!
//! Nothing here deletes anything from the sink - only the representation
//! submitted for the next turn is compressed, and masked placeholders carry
//! the content hash so originals stay joinable.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::IntraContextConfig;
use crate::model::{ChatMessage, ChatRole};
use echolog::content_hash;

/// One history entry inside the running phase
#[derive(Debug, Clone)]
pub struct TurnEntry {
    pub message: ChatMessage,
    pub turn: u32,
    /// Names of tools an assistant message called
    pub tool_call_names: Vec<String>,
    /// Tool-use id a tool-result message answers
    pub tool_use_id: Option<String>,
}

impl TurnEntry {
    pub fn new(message: ChatMessage, turn: u32) -> Self {
        Self {
            message,
            turn,
            tool_call_names: Vec::new(),
            tool_use_id: None,
        }
    }

    pub fn with_tool_calls(mut self, names: Vec<String>) -> Self {
        self.tool_call_names = names;
        self
    }

    pub fn with_tool_use_id(mut self, id: impl Into<String>) -> Self {
        self.tool_use_id = Some(id.into());
        self
    }
}

fn error_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(error|failed|failure|exception|panic|traceback)\b").unwrap())
}

/// Whether a message must survive compression untouched
pub fn has_error_marker(text: &str) -> bool {
    error_marker().is_match(text)
}

/// Apply the two-tier compression to a phase's turn history
pub fn compress(entries: &[TurnEntry], config: &IntraContextConfig) -> Vec<ChatMessage> {
    let max_turn = entries.iter().map(|e| e.turn).max().unwrap_or(0);
    let window_start = (max_turn + 1).saturating_sub(config.window as u32);

    entries
        .iter()
        .map(|entry| {
            if entry.turn >= window_start || has_error_marker(&entry.message.content) {
                return entry.message.clone();
            }
            compress_entry(entry, config)
        })
        .collect()
}

fn compress_entry(entry: &TurnEntry, config: &IntraContextConfig) -> ChatMessage {
    let content = &entry.message.content;
    match entry.message.role {
        ChatRole::Tool => {
            let id = entry.tool_use_id.as_deref().unwrap_or("unknown");
            let hash = content_hash(ChatRole::Tool.as_str(), content);
            ChatMessage::tool(format!("[tool result {}: {} bytes, hash {}]", id, content.len(), hash))
        }
        ChatRole::Assistant if !entry.tool_call_names.is_empty() => {
            ChatMessage::assistant(format!("[called tools: {}]", entry.tool_call_names.join(", ")))
        }
        ChatRole::Assistant if content.chars().count() > config.truncate_chars => {
            let clipped: String = content.chars().take(config.truncate_chars).collect();
            ChatMessage::assistant(format!("{}…[truncated]", clipped))
        }
        _ => entry.message.clone(),
    }
}

/// One failed loop_until attempt, shown during retry rebuilds
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub content: String,
    pub reason: String,
}

/// Tier 2: fresh context for a loop_until retry
///
/// Discards the turn history entirely: original task, the last L failed
/// attempts with their validator reasons, then the retry instruction.
pub fn build_retry_context(task: &str, attempts: &[RetryAttempt], config: &IntraContextConfig) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::user(task)];

    let shown = attempts.len().saturating_sub(config.retry_attempts_shown);
    for (index, attempt) in attempts.iter().enumerate().skip(shown) {
        messages.push(ChatMessage::assistant(attempt.content.clone()));
        messages.push(ChatMessage::user(format!(
            "Attempt {} was rejected: {}",
            index + 1,
            attempt.reason
        )));
    }

    messages.push(ChatMessage::user(
        "Produce a corrected response that satisfies the acceptance criterion.",
    ));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize) -> IntraContextConfig {
        IntraContextConfig {
            window,
            truncate_chars: 50,
            retry_attempts_shown: 2,
        }
    }

    #[test]
    fn test_window_kept_full() {
        let entries: Vec<TurnEntry> = (0..6)
            .map(|i| TurnEntry::new(ChatMessage::assistant(format!("reasoning turn {}", i)), i))
            .collect();

        let out = compress(&entries, &config(2));
        // Turns 4 and 5 are inside the window
        assert_eq!(out[4].content, "reasoning turn 4");
        assert_eq!(out[5].content, "reasoning turn 5");
    }

    #[test]
    fn test_old_tool_results_masked() {
        let payload = "a".repeat(4000);
        let entries = vec![
            TurnEntry::new(ChatMessage::tool(payload.clone()), 0).with_tool_use_id("call_1"),
            TurnEntry::new(ChatMessage::user("next"), 5),
        ];

        let out = compress(&entries, &config(2));
        assert!(out[0].content.starts_with("[tool result call_1: 4000 bytes, hash "));
        assert_eq!(out[0].role, ChatRole::Tool);
        // Hash joins back to the original
        let expected = content_hash("tool", &payload);
        assert!(out[0].content.contains(&expected));
    }

    #[test]
    fn test_old_assistant_tool_calls_collapsed() {
        let entries = vec![
            TurnEntry::new(ChatMessage::assistant("long deliberation"), 0)
                .with_tool_calls(vec!["grep".into(), "read".into()]),
            TurnEntry::new(ChatMessage::user("next"), 5),
        ];

        let out = compress(&entries, &config(2));
        assert_eq!(out[0].content, "[called tools: grep, read]");
    }

    #[test]
    fn test_old_reasoning_truncated() {
        let long = "word ".repeat(100);
        let entries = vec![
            TurnEntry::new(ChatMessage::assistant(long), 0),
            TurnEntry::new(ChatMessage::user("next"), 5),
        ];

        let out = compress(&entries, &config(2));
        assert!(out[0].content.ends_with("…[truncated]"));
        assert!(out[0].content.chars().count() < 80);
    }

    #[test]
    fn test_error_messages_always_preserved() {
        let content = format!("{} Error: connection refused", "x".repeat(4000));
        let entries = vec![
            TurnEntry::new(ChatMessage::tool(content.clone()), 0).with_tool_use_id("call_9"),
            TurnEntry::new(ChatMessage::user("next"), 9),
        ];

        let out = compress(&entries, &config(2));
        assert_eq!(out[0].content, content);
    }

    #[test]
    fn test_retry_context_shows_last_attempts() {
        let attempts = vec![
            RetryAttempt {
                content: "draft one".into(),
                reason: "too vague".into(),
            },
            RetryAttempt {
                content: "draft two".into(),
                reason: "missing citation".into(),
            },
            RetryAttempt {
                content: "draft three".into(),
                reason: "still missing citation".into(),
            },
        ];

        let messages = build_retry_context("Write the summary", &attempts, &config(5));
        // task + 2 attempts x 2 messages + retry instruction
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].content, "Write the summary");
        // Only the last two attempts survive
        assert!(messages.iter().all(|m| !m.content.contains("draft one")));
        assert!(messages[1].content.contains("draft two"));
        assert!(messages[3].content.contains("draft three"));
        assert!(messages[4].content.contains("Attempt 3"));
    }
}
