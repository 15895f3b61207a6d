//! Parser for the Responses-API SSE streaming variant:
//! `event: <name>` followed by `data: <json>`, recognizing
//! `response.output_text.delta`, `response.output_item.added` (starts a
//! function_call), `response.function_call_arguments.delta`, and
//! `response.completed`.

use serde_json::Value;

use crate::message::{StreamDelta, ToolCallDelta};

#[derive(Default)]
pub struct ResponsesStreamParser {
    pending_event: Option<String>,
}

impl ResponsesStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one SSE line (without its trailing newline) and returns a
    /// delta when the line completes an event, `None` for `event:` lines or
    /// blank separators.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamDelta> {
        if let Some(name) = line.strip_prefix("event: ") {
            self.pending_event = Some(name.trim().to_string());
            return None;
        }
        let data = line.strip_prefix("data: ")?;
        let event = self.pending_event.take()?;
        let payload: Value = serde_json::from_str(data).ok()?;
        self.interpret(&event, &payload)
    }

    fn interpret(&self, event: &str, payload: &Value) -> Option<StreamDelta> {
        match event {
            "response.output_text.delta" => {
                let chunk = payload.get("delta")?.as_str()?.to_string();
                Some(StreamDelta { content: Some(chunk), ..Default::default() })
            }
            "response.output_item.added" => {
                let item = payload.get("item")?;
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return None;
                }
                Some(StreamDelta {
                    tool_call_deltas: vec![ToolCallDelta {
                        id: item.get("call_id").and_then(Value::as_str).map(str::to_string),
                        name: item.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments_fragment: String::new(),
                    }],
                    ..Default::default()
                })
            }
            "response.function_call_arguments.delta" => {
                let fragment = payload.get("delta")?.as_str()?.to_string();
                Some(StreamDelta {
                    tool_call_deltas: vec![ToolCallDelta {
                        id: payload.get("call_id").and_then(Value::as_str).map(str::to_string),
                        name: None,
                        arguments_fragment: fragment,
                    }],
                    ..Default::default()
                })
            }
            "response.completed" => {
                let finish_reason = payload
                    .get("response")
                    .and_then(|r| r.get("status"))
                    .and_then(Value::as_str)
                    .unwrap_or("stop")
                    .to_string();
                Some(StreamDelta { finish_reason: Some(finish_reason), done: true, ..Default::default() })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_produces_content_chunk() {
        let mut parser = ResponsesStreamParser::new();
        assert!(parser.feed_line("event: response.output_text.delta").is_none());
        let delta = parser.feed_line(r#"data: {"delta": "Hello"}"#).unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hello"));
        assert!(!delta.done);
    }

    #[test]
    fn output_item_added_starts_function_call() {
        let mut parser = ResponsesStreamParser::new();
        parser.feed_line("event: response.output_item.added");
        let delta = parser
            .feed_line(r#"data: {"item": {"type": "function_call", "call_id": "c1", "name": "lookup"}}"#)
            .unwrap();
        assert_eq!(delta.tool_call_deltas[0].id.as_deref(), Some("c1"));
        assert_eq!(delta.tool_call_deltas[0].name.as_deref(), Some("lookup"));
    }

    #[test]
    fn non_function_call_output_item_is_ignored() {
        let mut parser = ResponsesStreamParser::new();
        parser.feed_line("event: response.output_item.added");
        let delta = parser.feed_line(r#"data: {"item": {"type": "message"}}"#);
        assert!(delta.is_none());
    }

    #[test]
    fn function_call_arguments_delta_carries_fragment() {
        let mut parser = ResponsesStreamParser::new();
        parser.feed_line("event: response.function_call_arguments.delta");
        let delta = parser.feed_line(r#"data: {"call_id": "c1", "delta": "{\"x\":"}"#).unwrap();
        assert_eq!(delta.tool_call_deltas[0].arguments_fragment, "{\"x\":");
    }

    #[test]
    fn completed_event_is_terminal() {
        let mut parser = ResponsesStreamParser::new();
        parser.feed_line("event: response.completed");
        let delta = parser.feed_line(r#"data: {"response": {"status": "completed"}}"#).unwrap();
        assert!(delta.done);
    }

    #[test]
    fn unrecognized_event_is_ignored() {
        let mut parser = ResponsesStreamParser::new();
        parser.feed_line("event: response.some_unknown_event");
        let delta = parser.feed_line(r#"data: {}"#);
        assert!(delta.is_none());
    }
}
