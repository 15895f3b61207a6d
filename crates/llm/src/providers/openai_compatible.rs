//! A single LLM client implementation against the OpenAI-compatible
//! `/chat/completions` surface — gives the [`LlmClient`] trait a real,
//! runnable body rather than leaving it abstract. Any endpoint speaking the
//! same chat-completions wire shape (OpenAI, or a compatible gateway in
//! front of another provider) can be pointed at by base URL and API key.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::client::{LlmClient, STREAM_BUFFER};
use crate::message::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, StreamDelta, ToolCall, ToolCallFunction, Usage,
};

pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into(), api_key: api_key.into(), model: model.into() }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        json!({
            "model": req.model.clone().unwrap_or_else(|| self.model.clone()),
            "messages": req.messages.iter().map(message_to_json).collect::<Vec<_>>(),
            "tools": req.tools.iter().map(|t| json!({
                "type": "function",
                "function": {"name": t.name, "description": t.description, "parameters": t.parameters},
            })).collect::<Vec<_>>(),
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": stream,
        })
    }
}

fn message_to_json(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };
    let mut obj = json!({ "role": role, "content": msg.content });
    if !msg.tool_calls.is_empty() {
        obj["tool_calls"] = json!(
            msg.tool_calls
                .iter()
                .map(|tc| json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.function.name, "arguments": tc.function.arguments},
                }))
                .collect::<Vec<_>>()
        );
    }
    if let Some(id) = &msg.tool_call_id {
        obj["tool_call_id"] = json!(id);
    }
    obj
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let payload = self.build_payload(&req, false);
        let response = self.http.post(self.endpoint()).bearer_auth(&self.api_key).json(&payload).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        if !status.is_success() {
            let message = body.get("error").and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or("request failed");
            anyhow::bail!("(status {}): {message}", status.as_u16());
        }

        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| anyhow::anyhow!("malformed response: no choices"))?;
        let message = choice.get("message").ok_or_else(|| anyhow::anyhow!("malformed response: no message"))?;
        let finish_reason = choice.get("finish_reason").and_then(Value::as_str).unwrap_or("stop").to_string();

        let content = message.get("content").and_then(Value::as_str).map(str::to_string);
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let function = tc.get("function")?;
                        Some(ToolCall {
                            id: tc.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                            function: ToolCallFunction {
                                name: function.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                                arguments: function.get("arguments").and_then(Value::as_str).unwrap_or("{}").to_string(),
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });

        Ok(ChatResponse {
            message: ChatMessage {
                role: ChatRole::Assistant,
                content,
                tool_calls,
                tool_call_id: None,
                tool_name: None,
            },
            finish_reason,
            usage,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
        use futures::StreamExt;

        let payload = self.build_payload(&req, true);
        let mut response = self.http.post(self.endpoint()).bearer_auth(&self.api_key).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            anyhow::bail!("(status {}): {body}", status.as_u16());
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut buf = String::new();
            while let Some(chunk) = response.chunk().await.unwrap_or(None) {
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line.is_empty() || line == "data: [DONE]" {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    let Ok(json) = serde_json::from_str::<Value>(data) else { continue };
                    let delta = json.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta"));
                    let content = delta.and_then(|d| d.get("content")).and_then(Value::as_str).map(str::to_string);
                    let finish_reason =
                        json.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("finish_reason")).and_then(Value::as_str);
                    if let Some(content) = content {
                        if tx.send(StreamDelta { content: Some(content), ..Default::default() }).await.is_err() {
                            return;
                        }
                    }
                    if let Some(reason) = finish_reason {
                        let _ = tx
                            .send(StreamDelta { finish_reason: Some(reason.to_string()), done: true, ..Default::default() })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
