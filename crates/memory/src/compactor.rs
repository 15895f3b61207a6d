//! Summarizes old conversation history and flushes it to durable storage.
//! Holds no ownership relationship back to the LLM chain or SessionStore —
//! it only borrows references handed to it at construction.

use std::sync::Arc;
use std::time::Duration;

use aigent_llm::{ChatMessage, ChatRequest, ChatRole, LlmClient};
use async_trait::async_trait;

use crate::memory::{Memory, total_chars};
use crate::session::{SessionStore, new_session};

const DEFAULT_BUDGET_CHARS: usize = 200_000;
const DEFAULT_TRIGGER_RATIO: f64 = 0.6;
const SUMMARIZE_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SUMMARIZE_PER_MESSAGE_CHARS: usize = 500;
const SUMMARIZE_PER_TOOL_ARGS_CHARS: usize = 200;
const EXTRACTIVE_PER_MESSAGE_CHARS: usize = 2000;
const RESEARCH_TOOL_RESULT_CHARS: usize = 5000;
const TOOL_RESULT_CHARS: usize = 2000;

/// Out-of-process sink for the concatenated observations pulled out of
/// compacted history. An external collaborator — this crate defines the
/// trait, never an implementation.
#[async_trait]
pub trait MemoryFlusher: Send + Sync {
    async fn append_daily_log(&self, observations: &str) -> anyhow::Result<()>;
}

pub struct CompactorConfig {
    pub llm: Option<Arc<dyn LlmClient>>,
    pub store: Option<Arc<SessionStore>>,
    pub budget_chars: usize,
    pub trigger_ratio: f64,
    pub flusher: Option<Arc<dyn MemoryFlusher>>,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            llm: None,
            store: None,
            budget_chars: DEFAULT_BUDGET_CHARS,
            trigger_ratio: DEFAULT_TRIGGER_RATIO,
            flusher: None,
        }
    }
}

pub struct Compactor {
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(config: CompactorConfig) -> Self {
        Self { config }
    }

    /// Returns `Ok(true)` if compaction ran, `Ok(false)` if under budget or
    /// nothing was safe to remove. The Memory lock is held across the
    /// optional LLM summarization call — each Memory belongs to one
    /// sequential per-task loop, so there is no concurrent reader to starve.
    pub async fn maybe_compact(&self, task_id: &str, mem: &Memory) -> anyhow::Result<bool> {
        let mut guard = mem.lock().await;

        if total_chars(&guard) as f64 <= self.config.budget_chars as f64 * self.config.trigger_ratio {
            return Ok(false);
        }

        let len = guard.messages.len();
        let mut split = len / 2;
        while split < len && guard.messages[split].role == ChatRole::Tool {
            split += 1;
        }
        if split == 0 || split >= len {
            return Ok(false);
        }

        let old_messages = guard.messages[..split].to_vec();

        if let Some(flusher) = &self.config.flusher {
            if let Some(observations) = build_observations(&old_messages) {
                if let Err(e) =
                    tokio::time::timeout(FLUSH_TIMEOUT, flusher.append_daily_log(&observations)).await
                {
                    tracing::warn!(error = %e, "long-term memory flush timed out");
                }
            }
        }

        let summary = self.summarize(&guard.summary, &old_messages).await;

        guard.messages = guard.messages[split..].to_vec();
        guard.summary = summary;

        if let Some(store) = &self.config.store {
            let data = new_session(task_id, guard.messages.clone(), Some(guard.summary.clone()));
            if let Err(e) = store.save(data).await {
                tracing::warn!(error = %e, task_id, "best-effort session save after compaction failed");
            }
        }

        Ok(true)
    }

    async fn summarize(&self, existing_summary: &str, old_messages: &[ChatMessage]) -> String {
        if let Some(llm) = &self.config.llm {
            let prompt = build_summarization_prompt(existing_summary, old_messages);
            let req = ChatRequest {
                messages: vec![ChatMessage::user(prompt)],
                tools: vec![],
                temperature: Some(0.3),
                max_tokens: Some(1024),
                model: None,
            };
            match tokio::time::timeout(SUMMARIZE_TIMEOUT, llm.chat(req)).await {
                Ok(Ok(resp)) => {
                    if let Some(content) = resp.message.content {
                        if !content.trim().is_empty() {
                            return content;
                        }
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "compaction summarization call failed, falling back to extractive summary"),
                Err(_) => tracing::warn!("compaction summarization call timed out, falling back to extractive summary"),
            }
        }
        extractive_summary(existing_summary, old_messages)
    }
}

fn build_summarization_prompt(existing_summary: &str, old_messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    out.push_str("Summarize the following conversation history concisely, preserving facts, decisions, and open threads.\n\n");
    if !existing_summary.is_empty() {
        out.push_str("Existing summary:\n");
        out.push_str(existing_summary);
        out.push_str("\n\n");
    }
    out.push_str("Messages:\n");
    for msg in old_messages {
        if let Some(content) = &msg.content {
            out.push_str(&format!("- [{:?}] {}\n", msg.role, clip(content, SUMMARIZE_PER_MESSAGE_CHARS)));
        }
        for tc in &msg.tool_calls {
            out.push_str(&format!(
                "- [tool_call] {} {}\n",
                tc.function.name,
                clip(&tc.function.arguments, SUMMARIZE_PER_TOOL_ARGS_CHARS)
            ));
        }
    }
    out
}

fn extractive_summary(existing_summary: &str, old_messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    if !existing_summary.is_empty() {
        lines.push(existing_summary.to_string());
    }
    for msg in old_messages {
        if let Some(content) = &msg.content {
            lines.push(format!("- [{:?}] {}", msg.role, clip(content, EXTRACTIVE_PER_MESSAGE_CHARS)));
        }
        for tc in &msg.tool_calls {
            lines.push(format!("- [tool_call] {}", tc.function.name));
        }
    }
    lines.join("\n")
}

/// Tags tool results and assistant final decisions for the long-term log.
/// Returns `None` when there is nothing to flush.
fn build_observations(old_messages: &[ChatMessage]) -> Option<String> {
    let mut observations = Vec::new();

    for msg in old_messages {
        match msg.role {
            ChatRole::Tool => {
                let Some(content) = &msg.content else { continue };
                let name = msg.tool_name.as_deref().unwrap_or("unknown");
                if name.contains("research") {
                    observations.push(format!("[research][tool:{name}] {}", clip(content, RESEARCH_TOOL_RESULT_CHARS)));
                } else {
                    observations.push(format!("[tool:{name}] {}", clip(content, TOOL_RESULT_CHARS)));
                }
            }
            ChatRole::Assistant if msg.tool_calls.is_empty() => {
                if let Some(content) = &msg.content {
                    observations.push(format!("[decision] {content}"));
                }
            }
            _ => {}
        }
    }

    if observations.is_empty() { None } else { Some(observations.join("\n")) }
}

fn clip(s: &str, max_len: usize) -> String {
    crate::memory::safe_truncate(s, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_llm::{ChatResponse, StreamDelta, ToolCall, ToolCallFunction};
    use tokio::sync::mpsc;

    struct StubLlm {
        response: String,
        fail: bool,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            if self.fail {
                anyhow::bail!("stub failure");
            }
            Ok(ChatResponse {
                message: ChatMessage::assistant(self.response.clone()),
                finish_reason: "stop".to_string(),
                usage: None,
            })
        }

        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn model_id(&self) -> &str {
            "stub"
        }
    }

    struct RecordingFlusher {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MemoryFlusher for RecordingFlusher {
        async fn append_daily_log(&self, observations: &str) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(observations.to_string());
            Ok(())
        }
    }

    async fn full_memory(n: usize) -> Memory {
        let mem = Memory::new("", 2_000, "gpt-4o");
        for i in 0..n {
            mem.append(ChatMessage::user(format!("message {i}: {}", "x".repeat(200)))).await;
        }
        mem
    }

    #[tokio::test]
    async fn under_budget_does_not_compact() {
        let mem = Memory::new("", 1_000_000, "gpt-4o");
        mem.append(ChatMessage::user("hi")).await;
        let compactor = Compactor::new(CompactorConfig::default());
        let compacted = compactor.maybe_compact("t1", &mem).await.unwrap();
        assert!(!compacted);
    }

    #[tokio::test]
    async fn over_budget_without_llm_uses_extractive_fallback() {
        let mem = full_memory(10).await;
        let config = CompactorConfig { budget_chars: 500, trigger_ratio: 0.5, ..CompactorConfig::default() };
        let compactor = Compactor::new(config);
        let compacted = compactor.maybe_compact("t1", &mem).await.unwrap();
        assert!(compacted);
        let summary = mem.summary().await;
        assert!(summary.contains("[user]") || summary.contains("message"));
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_extractive_summary() {
        let mem = full_memory(10).await;
        let config = CompactorConfig {
            budget_chars: 500,
            trigger_ratio: 0.5,
            llm: Some(Arc::new(StubLlm { response: String::new(), fail: true })),
            ..CompactorConfig::default()
        };
        let compactor = Compactor::new(config);
        assert!(compactor.maybe_compact("t1", &mem).await.unwrap());
        assert!(!mem.summary().await.is_empty());
    }

    #[tokio::test]
    async fn llm_success_uses_llm_summary() {
        let mem = full_memory(10).await;
        let config = CompactorConfig {
            budget_chars: 500,
            trigger_ratio: 0.5,
            llm: Some(Arc::new(StubLlm { response: "concise summary".to_string(), fail: false })),
            ..CompactorConfig::default()
        };
        let compactor = Compactor::new(config);
        assert!(compactor.maybe_compact("t1", &mem).await.unwrap());
        assert_eq!(mem.summary().await, "concise summary");
    }

    #[tokio::test]
    async fn compaction_shrinks_message_count() {
        let mem = full_memory(10).await;
        let before = mem.len().await;
        let config = CompactorConfig { budget_chars: 500, trigger_ratio: 0.5, ..CompactorConfig::default() };
        Compactor::new(config).maybe_compact("t1", &mem).await.unwrap();
        assert!(mem.len().await < before);
    }

    #[tokio::test]
    async fn flusher_receives_tagged_tool_results() {
        let mem = Memory::new("", 2_000, "gpt-4o");
        mem.append(ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall { id: "1".into(), function: ToolCallFunction { name: "research_web".into(), arguments: "{}".into() } }],
        ))
        .await;
        mem.append(ChatMessage::tool_result("1", "research_web", "r".repeat(300))).await;
        for i in 0..10 {
            mem.append(ChatMessage::user(format!("filler {i}: {}", "y".repeat(100)))).await;
        }

        let flusher = Arc::new(RecordingFlusher { seen: std::sync::Mutex::new(Vec::new()) });
        let config = CompactorConfig {
            budget_chars: 500,
            trigger_ratio: 0.5,
            flusher: Some(flusher.clone()),
            ..CompactorConfig::default()
        };
        Compactor::new(config).maybe_compact("t1", &mem).await.unwrap();

        let seen = flusher.seen.lock().unwrap();
        if !seen.is_empty() {
            assert!(seen[0].contains("[research][tool:research_web]"));
        }
    }

    #[test]
    fn build_observations_returns_none_for_empty_input() {
        assert!(build_observations(&[]).is_none());
    }

    #[test]
    fn build_observations_tags_plain_tool_result() {
        let messages = vec![ChatMessage::tool_result("1", "read_file", "contents")];
        let observations = build_observations(&messages).unwrap();
        assert!(observations.contains("[tool:read_file]"));
    }

    #[test]
    fn build_observations_tags_decisions() {
        let messages = vec![ChatMessage::assistant("final answer")];
        let observations = build_observations(&messages).unwrap();
        assert!(observations.contains("[decision] final answer"));
    }
}
