//! Tool-calling conversation loop with hooks, compaction, and session
//! persistence.

use std::sync::Arc;

use aigent_exec::ToolExecutor;
use aigent_llm::{ChatMessage, ChatRequest, LlmClient};
use aigent_memory::{Compactor, Memory, SessionStore, context_budget_for_model, new_session, safe_truncate};
use aigent_tools::ToolRegistry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::hooks::{HookContext, HookPoint, HookRegistry};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
const MIN_MAX_TOOL_RESULT_CHARS: usize = 2_000;
const MAX_MAX_TOOL_RESULT_CHARS: usize = 400_000;
const LLM_CALL_ERROR_MESSAGE: &str = "something went wrong, please try again";
const TOOL_RESULT_TRUNCATION_MARKER: &str = "\n[TRUNCATED]";

/// A unit of work handed to [`AgentExecutor::execute`]: a stable id used to
/// key session persistence, and prior turns to seed Memory with when no
/// persisted session exists yet.
pub struct Task {
    pub id: String,
    pub history: Vec<ChatMessage>,
}

pub struct AgentExecutorConfig {
    pub llm: Arc<dyn LlmClient>,
    pub tool_executor: Arc<ToolExecutor>,
    pub tool_registry: Arc<ToolRegistry>,
    pub compactor: Arc<Compactor>,
    pub session_store: Arc<SessionStore>,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub system_prompt: String,
    pub model_name: String,
    pub max_iterations: usize,
}

pub struct AgentExecutor {
    llm: Arc<dyn LlmClient>,
    tool_executor: Arc<ToolExecutor>,
    tool_registry: Arc<ToolRegistry>,
    hooks: HookRegistry,
    compactor: Arc<Compactor>,
    session_store: Arc<SessionStore>,
    audit: Option<Arc<dyn AuditSink>>,
    system_prompt: String,
    model_name: String,
    max_iterations: usize,
    max_tool_result_chars: usize,
}

impl AgentExecutor {
    pub fn new(config: AgentExecutorConfig) -> Self {
        let budget = context_budget_for_model(&config.model_name);
        let max_tool_result_chars = (budget / 4).clamp(MIN_MAX_TOOL_RESULT_CHARS, MAX_MAX_TOOL_RESULT_CHARS);
        Self {
            llm: config.llm,
            tool_executor: config.tool_executor,
            tool_registry: config.tool_registry,
            hooks: HookRegistry::default(),
            compactor: config.compactor,
            session_store: config.session_store,
            audit: config.audit,
            system_prompt: config.system_prompt,
            model_name: config.model_name,
            max_iterations: if config.max_iterations == 0 { DEFAULT_MAX_ITERATIONS } else { config.max_iterations },
            max_tool_result_chars,
        }
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Runs the tool-calling loop for one task. Never returns an `Err` —
    /// every failure mode (LLM error, loop exhaustion) surfaces as a fixed
    /// user-visible string while the raw cause goes to the `OnError` hook
    /// and tracing.
    pub async fn execute(&self, task: &Task, message: ChatMessage, cancel: CancellationToken) -> String {
        let mem = Memory::new(self.system_prompt.clone(), 0, &self.model_name);

        match self.session_store.load(&task.id).await {
            Ok(Some(data)) => {
                tracing::info!(task_id = %task.id, "recovered session from store");
                mem.load_from_store(data.messages, data.summary).await;
            }
            Ok(None) => {
                for msg in &task.history {
                    mem.append(msg.clone()).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, task_id = %task.id, "session load failed, starting fresh");
                for msg in &task.history {
                    mem.append(msg.clone()).await;
                }
            }
        }
        mem.append(message).await;

        for _ in 0..self.max_iterations {
            if cancel.is_cancelled() {
                self.persist(&task.id, &mem).await;
                return "cancelled before completion".to_string();
            }

            if let Err(e) = self.compactor.maybe_compact(&task.id, &mem).await {
                tracing::warn!(error = %e, task_id = %task.id, "compaction failed, continuing with pre-compaction memory");
            }

            let correlation_id = Uuid::new_v4().to_string();
            let messages = mem.messages().await;

            self.fire(
                HookPoint::BeforeLLMCall,
                HookContext { correlation_id: correlation_id.clone(), task_id: task.id.clone(), messages: Some(messages.clone()), ..Default::default() },
            )
            .await;

            let req = ChatRequest {
                messages,
                tools: self.tool_registry.definitions(),
                temperature: None,
                max_tokens: None,
                model: Some(self.model_name.clone()),
            };

            let response = match self.llm.chat(req).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, task_id = %task.id, "llm call failed");
                    self.fire(
                        HookPoint::OnError,
                        HookContext { correlation_id, task_id: task.id.clone(), error: Some(e.to_string()), ..Default::default() },
                    )
                    .await;
                    return LLM_CALL_ERROR_MESSAGE.to_string();
                }
            };

            self.fire(
                HookPoint::AfterLLMCall,
                HookContext { correlation_id: correlation_id.clone(), task_id: task.id.clone(), response: Some(response.clone()), ..Default::default() },
            )
            .await;

            mem.append(response.message.clone()).await;

            if response.finish_reason == "stop" || !response.has_tool_calls() {
                self.persist(&task.id, &mem).await;
                return response.message.content.clone().unwrap_or_default();
            }

            for call in &response.message.tool_calls {
                self.fire(
                    HookPoint::BeforeToolExec,
                    HookContext {
                        correlation_id: correlation_id.clone(),
                        task_id: task.id.clone(),
                        tool_name: Some(call.function.name.clone()),
                        tool_input: Some(call.function.arguments.clone()),
                        ..Default::default()
                    },
                )
                .await;

                let output = self.tool_executor.execute_tool_call(&self.tool_registry, call).await;
                let truncated = truncate_tool_result(&output.output, self.max_tool_result_chars);

                self.fire(
                    HookPoint::AfterToolExec,
                    HookContext {
                        correlation_id: correlation_id.clone(),
                        task_id: task.id.clone(),
                        tool_name: Some(call.function.name.clone()),
                        tool_output: Some(truncated.clone()),
                        ..Default::default()
                    },
                )
                .await;

                mem.append(ChatMessage::tool_result(call.id.clone(), call.function.name.clone(), truncated)).await;
            }
        }

        self.persist(&task.id, &mem).await;
        format!("exceeded max iterations ({})", self.max_iterations)
    }

    /// Wraps [`Self::execute`], emitting the single final message on a
    /// bounded channel.
    pub async fn execute_stream(
        &self,
        task: &Task,
        message: ChatMessage,
        cancel: CancellationToken,
    ) -> tokio::sync::mpsc::Receiver<aigent_llm::StreamDelta> {
        let (tx, rx) = tokio::sync::mpsc::channel(aigent_llm::STREAM_BUFFER);
        let content = self.execute(task, message, cancel).await;
        let _ = tx
            .send(aigent_llm::StreamDelta {
                content: Some(content),
                tool_call_deltas: vec![],
                finish_reason: Some("stop".to_string()),
                usage: None,
                done: true,
            })
            .await;
        rx
    }

    async fn persist(&self, task_id: &str, mem: &Memory) {
        let data = new_session(task_id, mem.snapshot_messages().await, Some(mem.summary().await));
        if let Err(e) = self.session_store.save(data).await {
            tracing::warn!(error = %e, task_id, "session persistence failed");
        }
    }

    async fn fire(&self, point: HookPoint, ctx: HookContext) {
        self.hooks.fire(point, &ctx);
        if let Some(audit) = &self.audit {
            let event = AuditEvent {
                ts: chrono::Utc::now(),
                event: audit_event_name(point).to_string(),
                correlation_id: Some(ctx.correlation_id.clone()).filter(|s| !s.is_empty()),
                task_id: Some(ctx.task_id.clone()).filter(|s| !s.is_empty()),
                fields: audit_fields(&ctx),
            };
            if let Err(e) = audit.emit(event).await {
                tracing::warn!(error = %e, "audit emit failed");
            }
        }
    }
}

fn audit_event_name(point: HookPoint) -> &'static str {
    match point {
        HookPoint::BeforeLLMCall => "before_llm_call",
        HookPoint::AfterLLMCall => "after_llm_call",
        HookPoint::BeforeToolExec => "before_tool_exec",
        HookPoint::AfterToolExec => "after_tool_exec",
        HookPoint::OnError => "on_error",
    }
}

fn audit_fields(ctx: &HookContext) -> Option<serde_json::Value> {
    let mut fields = serde_json::Map::new();
    if let Some(name) = &ctx.tool_name {
        fields.insert("tool_name".to_string(), serde_json::Value::String(name.clone()));
    }
    if let Some(error) = &ctx.error {
        fields.insert("error".to_string(), serde_json::Value::String(error.clone()));
    }
    if fields.is_empty() { None } else { Some(serde_json::Value::Object(fields)) }
}

fn truncate_tool_result(content: &str, max_len: usize) -> String {
    if content.len() <= max_len {
        return content.to_string();
    }
    let budget = max_len.saturating_sub(TOOL_RESULT_TRUNCATION_MARKER.len());
    let mut truncated = safe_truncate(content, budget);
    truncated.push_str(TOOL_RESULT_TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_exec::ExecutionPolicy;
    use aigent_llm::{ChatResponse, StreamDelta, ToolCall, ToolCallFunction};
    use aigent_memory::CompactorConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        responses: std::sync::Mutex<Vec<anyhow::Result<ChatResponse>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("no more scripted responses");
            }
            responses.remove(0)
        }

        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn executor(llm: Arc<dyn LlmClient>, dir: &tempfile::TempDir, max_iterations: usize) -> AgentExecutor {
        let tool_executor = Arc::new(ToolExecutor::new(ExecutionPolicy { approval_mode: aigent_config::ApprovalMode::Autonomous, ..ExecutionPolicy::default() }));
        let tool_registry = Arc::new(ToolRegistry::default());
        let compactor = Arc::new(Compactor::new(CompactorConfig::default()));
        let session_store = Arc::new(SessionStore::new(dir.path()));
        AgentExecutor::new(AgentExecutorConfig {
            llm,
            tool_executor,
            tool_registry,
            compactor,
            session_store,
            audit: None,
            system_prompt: "You are a helpful agent.".to_string(),
            model_name: "gpt-4o".to_string(),
            max_iterations,
        })
    }

    #[tokio::test]
    async fn stops_immediately_when_finish_reason_is_stop() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![Ok(ChatResponse {
                message: ChatMessage::assistant("final answer"),
                finish_reason: "stop".to_string(),
                usage: None,
            })]),
        });
        let exec = executor(llm, &dir, DEFAULT_MAX_ITERATIONS);
        let task = Task { id: "t1".to_string(), history: vec![] };
        let result = exec.execute(&task, ChatMessage::user("hi"), CancellationToken::new()).await;
        assert_eq!(result, "final answer");
    }

    #[tokio::test]
    async fn llm_error_returns_fixed_user_visible_message() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm { responses: std::sync::Mutex::new(vec![Err(anyhow::anyhow!("provider down"))]) });
        let exec = executor(llm, &dir, DEFAULT_MAX_ITERATIONS);
        let task = Task { id: "t2".to_string(), history: vec![] };
        let result = exec.execute(&task, ChatMessage::user("hi"), CancellationToken::new()).await;
        assert_eq!(result, LLM_CALL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn loop_exhaustion_reports_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let looping_response = || {
            Ok(ChatResponse {
                message: ChatMessage::assistant_tool_calls(
                    None,
                    vec![ToolCall { id: "1".into(), function: ToolCallFunction { name: "nonexistent".into(), arguments: "{}".into() } }],
                ),
                finish_reason: "tool_calls".to_string(),
                usage: None,
            })
        };
        let llm = Arc::new(ScriptedLlm { responses: std::sync::Mutex::new((0..3).map(|_| looping_response()).collect()) });
        let exec = executor(llm, &dir, 3);
        let task = Task { id: "t3".to_string(), history: vec![] };
        let result = exec.execute(&task, ChatMessage::user("hi"), CancellationToken::new()).await;
        assert_eq!(result, "exceeded max iterations (3)");
    }

    #[tokio::test]
    async fn cancellation_before_loop_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm { responses: std::sync::Mutex::new(vec![]) });
        let exec = executor(llm, &dir, DEFAULT_MAX_ITERATIONS);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = Task { id: "t4".to_string(), history: vec![] };
        let result = exec.execute(&task, ChatMessage::user("hi"), cancel).await;
        assert_eq!(result, "cancelled before completion");
    }

    #[tokio::test]
    async fn hooks_fire_before_and_after_llm_call() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![Ok(ChatResponse { message: ChatMessage::assistant("ok"), finish_reason: "stop".to_string(), usage: None })]),
        });
        let mut exec = executor(llm, &dir, DEFAULT_MAX_ITERATIONS);
        let before_count = Arc::new(AtomicUsize::new(0));
        let after_count = Arc::new(AtomicUsize::new(0));
        let b = before_count.clone();
        let a = after_count.clone();
        exec.hooks_mut().register(HookPoint::BeforeLLMCall, Arc::new(move |_| { b.fetch_add(1, Ordering::SeqCst); }));
        exec.hooks_mut().register(HookPoint::AfterLLMCall, Arc::new(move |_| { a.fetch_add(1, Ordering::SeqCst); }));

        let task = Task { id: "t5".to_string(), history: vec![] };
        exec.execute(&task, ChatMessage::user("hi"), CancellationToken::new()).await;

        assert_eq!(before_count.load(Ordering::SeqCst), 1);
        assert_eq!(after_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_is_persisted_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm {
            responses: std::sync::Mutex::new(vec![Ok(ChatResponse { message: ChatMessage::assistant("done"), finish_reason: "stop".to_string(), usage: None })]),
        });
        let exec = executor(llm, &dir, DEFAULT_MAX_ITERATIONS);
        let task = Task { id: "t6".to_string(), history: vec![] };
        exec.execute(&task, ChatMessage::user("hi"), CancellationToken::new()).await;

        let session_store = SessionStore::new(dir.path());
        let saved = session_store.load("t6").await.unwrap().unwrap();
        assert!(saved.messages.iter().any(|m| m.content.as_deref() == Some("done")));
    }

    // ── truncate_tool_result ─────────────────────────────────────────────

    #[test]
    fn truncate_tool_result_leaves_short_content_untouched() {
        assert_eq!(truncate_tool_result("short", 100), "short");
    }

    #[test]
    fn truncate_tool_result_adds_marker_when_over_limit() {
        let result = truncate_tool_result(&"x".repeat(1000), 100);
        assert!(result.len() <= 100);
        assert!(result.ends_with(TOOL_RESULT_TRUNCATION_MARKER));
    }
}
