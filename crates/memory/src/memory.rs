//! Bounded conversation buffer with model-aware character budget,
//! structural group-preserving trimming, and tool-result pruning.

use aigent_llm::{ChatMessage, ChatRole};
use tokio::sync::Mutex;

/// `(name_prefix, context_window_tokens)`, longest prefix wins so e.g.
/// "llama3.1" never matches "llama3" first.
const CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("claude-3-5", 200_000),
    ("claude-3", 200_000),
    ("gemini-1.5-pro", 2_000_000),
    ("gemini-1.5", 1_000_000),
    ("llama3.1", 128_000),
    ("llama3", 8_192),
    ("qwen2.5", 32_768),
    ("mistral", 32_768),
];

const DEFAULT_BUDGET_CHARS: usize = (128_000.0 * 4.0 * 0.85) as usize;
const APPEND_TRUNCATE_AT: usize = 50_000;
const TOOL_RESULT_PRUNE_CONTENT_MIN: usize = 200;

/// `tokens * 4 chars/token * 0.85 safety factor`, via the longest matching
/// lowercase prefix in [`CONTEXT_WINDOWS`]. Unknown models fall back to
/// [`DEFAULT_BUDGET_CHARS`].
pub fn context_budget_for_model(name: &str) -> usize {
    let lower = name.to_lowercase();
    CONTEXT_WINDOWS
        .iter()
        .filter(|(prefix, _)| lower.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, tokens)| (*tokens as f64 * 4.0 * 0.85) as usize)
        .unwrap_or(DEFAULT_BUDGET_CHARS)
}

pub(crate) struct MemoryState {
    pub(crate) system_prompt: String,
    pub(crate) summary: String,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) max_chars: usize,
}

/// All mutations are serialized under a mutex.
pub struct Memory {
    state: Mutex<MemoryState>,
}

impl Memory {
    pub fn new(system_prompt: impl Into<String>, max_chars: usize, model_name: &str) -> Self {
        let max_chars = if max_chars == 0 { context_budget_for_model(model_name) } else { max_chars };
        Self {
            state: Mutex::new(MemoryState {
                system_prompt: system_prompt.into(),
                summary: String::new(),
                messages: Vec::new(),
                max_chars,
            }),
        }
    }

    pub async fn append(&self, mut msg: ChatMessage) {
        if let Some(content) = &msg.content {
            if content.len() > APPEND_TRUNCATE_AT {
                let mut truncated = safe_truncate(content, APPEND_TRUNCATE_AT);
                truncated.push_str("\n[TRUNCATED]");
                msg.content = Some(truncated);
            }
        }
        let mut state = self.state.lock().await;
        state.messages.push(msg);
        trim(&mut state);
    }

    /// Returns a fresh list: a synthesized system message (prompt + summary,
    /// each part only if non-empty) prepended when either is present,
    /// followed by the conversation in order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(state.messages.len() + 1);

        let mut system_content = state.system_prompt.clone();
        if !state.summary.is_empty() {
            if !system_content.is_empty() {
                system_content.push_str("\n\n");
            }
            system_content.push_str("## Conversation Summary (prior context)\n");
            system_content.push_str(&state.summary);
        }
        if !system_content.is_empty() {
            out.push(ChatMessage::system(system_content));
        }

        out.extend(state.messages.iter().cloned());
        out
    }

    pub async fn load_from_store(&self, messages: Vec<ChatMessage>, summary: Option<String>) {
        let mut state = self.state.lock().await;
        state.messages = messages;
        state.summary = summary.unwrap_or_default();
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.messages.clear();
    }

    pub async fn total_chars(&self) -> usize {
        let state = self.state.lock().await;
        total_chars(&state)
    }

    pub async fn summary(&self) -> String {
        self.state.lock().await.summary.clone()
    }

    pub async fn set_summary(&self, summary: String) {
        self.state.lock().await.summary = summary;
    }

    pub async fn snapshot_messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn replace_messages(&self, messages: Vec<ChatMessage>) {
        self.state.lock().await.messages = messages;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    /// Locks the entire memory for the duration of the guard. The Compactor
    /// holds this across its LLM summarization call: each
    /// Memory belongs to one sequential per-task loop, so there are no
    /// concurrent readers to starve.
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().await
    }
}

pub(crate) fn total_chars(state: &MemoryState) -> usize {
    let mut total = state.system_prompt.len() + state.summary.len();
    for msg in &state.messages {
        let weight = if msg.role == ChatRole::Tool { 2 } else { 1 };
        total += (msg.content_len() + role_len(msg.role)) * weight;
        for tc in &msg.tool_calls {
            total += tc.function.name.len() + tc.function.arguments.len();
        }
    }
    total
}

fn role_len(role: ChatRole) -> usize {
    match role {
        ChatRole::System => 6,
        ChatRole::User => 4,
        ChatRole::Assistant => 9,
        ChatRole::Tool => 4,
    }
}

fn trim(state: &mut MemoryState) {
    prune_old_tool_results(state);
    drop_oldest_groups(state);
}

/// Phase 1: while over budget, replace the oldest half of over-200-char
/// tool results with a pruning marker.
fn prune_old_tool_results(state: &mut MemoryState) {
    while total_chars(state) > state.max_chars {
        let prunable: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == ChatRole::Tool && m.content_len() > TOOL_RESULT_PRUNE_CONTENT_MIN)
            .map(|(i, _)| i)
            .collect();

        if prunable.is_empty() {
            return;
        }

        let prune_count = prunable.len() / 2;
        if prune_count == 0 {
            return;
        }

        for &idx in &prunable[..prune_count] {
            let name = state.messages[idx].tool_name.clone().unwrap_or_else(|| "tool".to_string());
            let len = state.messages[idx].content_len();
            state.messages[idx].content =
                Some(format!("[Tool result from {name} — {len} chars, pruned for context space]"));
        }
    }
}

/// Phase 2: while still over budget and more than one message remains, drop
/// the oldest complete group.
fn drop_oldest_groups(state: &mut MemoryState) {
    while total_chars(state) > state.max_chars && state.messages.len() > 1 {
        let group_len = first_group_len(&state.messages);
        if group_len >= state.messages.len() {
            return;
        }
        state.messages.drain(0..group_len);
    }
}

pub(crate) fn first_group_len(messages: &[ChatMessage]) -> usize {
    match messages.first() {
        None => 0,
        Some(first) if first.role == ChatRole::Tool => {
            messages.iter().take_while(|m| m.role == ChatRole::Tool).count()
        }
        Some(first) if first.role == ChatRole::Assistant && !first.tool_calls.is_empty() => {
            1 + messages[1..].iter().take_while(|m| m.role == ChatRole::Tool).count()
        }
        Some(_) => 1,
    }
}

/// UTF-8-safe truncation: walk backward from `max_len` to the nearest
/// char boundary.
pub fn safe_truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── context budget table ───────────────────────────────────────────

    #[test]
    fn longest_prefix_wins_for_llama_variants() {
        assert_eq!(context_budget_for_model("llama3.1:8b"), (128_000.0 * 4.0 * 0.85) as usize);
        assert_eq!(context_budget_for_model("llama3:8b"), (8_192.0 * 4.0 * 0.85) as usize);
    }

    #[test]
    fn unknown_model_uses_default_budget() {
        assert_eq!(context_budget_for_model("some-unknown-model"), DEFAULT_BUDGET_CHARS);
    }

    // ── append truncation ──────────────────────────────────────────────

    #[tokio::test]
    async fn append_truncates_content_over_50000_chars() {
        let mem = Memory::new("", 10_000_000, "gpt-4o");
        let huge = "x".repeat(60_000);
        mem.append(ChatMessage::user(huge)).await;
        let messages = mem.messages().await;
        let content = messages[0].content.as_ref().unwrap();
        assert!(content.ends_with("[TRUNCATED]"));
        assert!(content.len() <= 50_000 + "\n[TRUNCATED]".len());
    }

    // ── invariant: first message is never a tool-result ────────────────

    #[tokio::test]
    async fn first_message_never_a_tool_result_after_trim() {
        let mem = Memory::new("", 500, "gpt-4o");
        mem.append(ChatMessage::user("u".repeat(100))).await;
        mem.append(ChatMessage::assistant_tool_calls(
            None,
            vec![aigent_llm::ToolCall {
                id: "1".into(),
                function: aigent_llm::ToolCallFunction { name: "f".into(), arguments: "{}".into() },
            }],
        ))
        .await;
        mem.append(ChatMessage::tool_result("1", "f", "r".repeat(300))).await;

        let messages = mem.snapshot_messages().await;
        if let Some(first) = messages.first() {
            assert_ne!(first.role, ChatRole::Tool);
        }
    }

    #[tokio::test]
    async fn tool_result_survivor_keeps_preceding_assistant() {
        let mem = Memory::new("", 500, "gpt-4o");
        mem.append(ChatMessage::user("u".repeat(50))).await;
        mem.append(ChatMessage::assistant_tool_calls(
            None,
            vec![aigent_llm::ToolCall {
                id: "1".into(),
                function: aigent_llm::ToolCallFunction { name: "f".into(), arguments: "{}".into() },
            }],
        ))
        .await;
        mem.append(ChatMessage::tool_result("1", "f", "r".repeat(300))).await;

        let messages = mem.snapshot_messages().await;
        if let Some(pos) = messages.iter().position(|m| m.role == ChatRole::Tool) {
            assert!(pos > 0, "tool result present without its preceding assistant");
            assert_eq!(messages[pos - 1].role, ChatRole::Assistant);
        }
    }

    // ── boundary: budget smaller than a single message ─────────────────

    #[tokio::test]
    async fn budget_smaller_than_one_message_keeps_only_the_last() {
        let mem = Memory::new("", 10, "gpt-4o");
        mem.append(ChatMessage::user("first message, fairly long")).await;
        mem.append(ChatMessage::user("second message, also long")).await;
        let messages = mem.snapshot_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.as_deref(), Some("second message, also long"));
    }

    // ── Messages() synthesizes system+summary ───────────────────────────

    #[tokio::test]
    async fn messages_prepends_prompt_and_summary_when_present() {
        let mem = Memory::new("You are helpful.", 100_000, "gpt-4o");
        mem.set_summary("earlier events".to_string()).await;
        mem.append(ChatMessage::user("hi")).await;
        let messages = mem.messages().await;
        assert_eq!(messages[0].role, ChatRole::System);
        let content = messages[0].content.as_ref().unwrap();
        assert!(content.contains("You are helpful."));
        assert!(content.contains("earlier events"));
    }

    #[tokio::test]
    async fn messages_has_no_system_prefix_when_both_empty() {
        let mem = Memory::new("", 100_000, "gpt-4o");
        mem.append(ChatMessage::user("hi")).await;
        let messages = mem.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ChatRole::User);
    }

    // ── safe_truncate ────────────────────────────────────────────────────

    #[test]
    fn safe_truncate_never_splits_a_utf8_char() {
        let s = "a".repeat(9) + "é"; // 'é' is 2 bytes in UTF-8
        let truncated = safe_truncate(&s, 10);
        assert!(String::from_utf8(truncated.clone().into_bytes()).is_ok());
        assert!(truncated.len() <= 10);
    }
}
