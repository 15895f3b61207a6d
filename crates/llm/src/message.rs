use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation. Immutable after construction —
/// callers that need to change a message append a new one instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant, in call order. Only populated
    /// on assistant messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, the id of the ToolCall this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// When role == Tool, the name of the tool that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }

    /// Character length of `content`, 0 when absent. Used by Memory's
    /// weighted character accounting.
    pub fn content_len(&self) -> usize {
        self.content.as_deref().map(str::len).unwrap_or(0)
    }
}

/// A tool call requested by the LLM. Arguments are kept as the raw JSON
/// string the provider sent — an opaque payload, parsed only where a
/// consumer (ConfidenceScorer, ToolExecutor) needs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn has_valid_arguments(&self) -> bool {
        !self.function.name.is_empty()
            && serde_json::from_str::<serde_json::Value>(&self.function.arguments).is_ok()
    }
}

/// A tool's callable surface: name, human description, and a JSON-schema
/// document describing its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request shape accepted by an [`crate::client::LlmClient`].
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Response from a non-streaming chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.message.tool_calls.is_empty()
    }
}

/// One increment of a streaming response. At most one delta in a stream has
/// `done = true`, and it is always last.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_call_deltas: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_with_empty_name_is_invalid() {
        let tc = ToolCall { id: "1".into(), function: ToolCallFunction { name: String::new(), arguments: "{}".into() } };
        assert!(!tc.has_valid_arguments());
    }

    #[test]
    fn tool_call_with_malformed_json_is_invalid() {
        let tc = ToolCall { id: "1".into(), function: ToolCallFunction { name: "f".into(), arguments: "{not json".into() } };
        assert!(!tc.has_valid_arguments());
    }

    #[test]
    fn tool_call_with_valid_json_is_valid() {
        let tc = ToolCall { id: "1".into(), function: ToolCallFunction { name: "f".into(), arguments: "{\"a\":1}".into() } };
        assert!(tc.has_valid_arguments());
    }

    #[test]
    fn content_len_zero_when_absent() {
        let msg = ChatMessage::assistant_tool_calls(None, vec![]);
        assert_eq!(msg.content_len(), 0);
    }
}
