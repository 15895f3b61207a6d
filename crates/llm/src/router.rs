use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::{LlmClient, STREAM_BUFFER};
use crate::confidence::ConfidenceScorer;
use crate::message::{ChatRequest, ChatResponse, StreamDelta};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("brain error and no remote configured: {0}")]
    BrainFailed(anyhow::Error),
}

/// Brain-first, remote-fallback chat. Holds a local "brain"
/// client, an optional remote client, and a confidence threshold.
pub struct Router {
    brain: Arc<dyn LlmClient>,
    remote: Option<Arc<dyn LlmClient>>,
    threshold: f32,
}

impl Router {
    pub fn new(brain: Arc<dyn LlmClient>, remote: Option<Arc<dyn LlmClient>>) -> Self {
        Self { brain, remote, threshold: DEFAULT_CONFIDENCE_THRESHOLD }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, RouterError> {
        let tools_requested = !req.tools.is_empty();
        let brain_result = self.brain.chat(req.clone()).await;

        let brain_resp = match brain_result {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(remote) = &self.remote {
                    return remote.chat(req).await.map_err(RouterError::BrainFailed);
                }
                return Err(RouterError::BrainFailed(e));
            }
        };

        let confidence = ConfidenceScorer::score(&brain_resp, tools_requested);
        if confidence >= self.threshold {
            return Ok(brain_resp);
        }

        match &self.remote {
            Some(remote) => remote.chat(req).await.map_err(RouterError::BrainFailed),
            None => Ok(brain_resp),
        }
    }

    /// Same acceptance decision as [`Self::chat`], computed from a
    /// non-streaming brain call. On acceptance the brain's content and tool
    /// calls are replayed as deltas on a buffered channel terminated by a
    /// single done delta; on rejection with a remote configured, streaming
    /// is delegated to the remote client.
    pub async fn chat_stream(&self, req: ChatRequest) -> Result<mpsc::Receiver<StreamDelta>, RouterError> {
        let tools_requested = !req.tools.is_empty();
        let brain_resp = match self.brain.chat(req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(remote) = &self.remote {
                    return remote.chat_stream(req).await.map_err(RouterError::BrainFailed);
                }
                return Err(RouterError::BrainFailed(e));
            }
        };

        let confidence = ConfidenceScorer::score(&brain_resp, tools_requested);
        if confidence >= self.threshold {
            return Ok(emit_buffered(brain_resp));
        }

        match &self.remote {
            Some(remote) => remote.chat_stream(req).await.map_err(RouterError::BrainFailed),
            None => Ok(emit_buffered(brain_resp)),
        }
    }
}

fn emit_buffered(resp: ChatResponse) -> mpsc::Receiver<StreamDelta> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        if let Some(content) = resp.message.content.clone() {
            if !content.is_empty() {
                let _ = tx.send(StreamDelta { content: Some(content), ..Default::default() }).await;
            }
        }
        for tc in &resp.message.tool_calls {
            let _ = tx
                .send(StreamDelta {
                    tool_call_deltas: vec![crate::message::ToolCallDelta {
                        id: Some(tc.id.clone()),
                        name: Some(tc.function.name.clone()),
                        arguments_fragment: tc.function.arguments.clone(),
                    }],
                    ..Default::default()
                })
                .await;
        }
        let _ = tx
            .send(StreamDelta { finish_reason: Some(resp.finish_reason.clone()), done: true, ..Default::default() })
            .await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        calls: AtomicUsize,
        result: Result<String, String>,
    }

    #[async_trait]
    impl LlmClient for StubClient {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(content) => Ok(ChatResponse {
                    message: ChatMessage::assistant(content.clone()),
                    finish_reason: "stop".to_string(),
                    usage: Some(Usage::default()),
                }),
                Err(msg) => Err(anyhow::anyhow!(msg.clone())),
            }
        }

        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
            unimplemented!()
        }

        fn model_id(&self) -> &str {
            "stub"
        }
    }

    fn stub(result: Result<&str, &str>) -> Arc<StubClient> {
        Arc::new(StubClient {
            calls: AtomicUsize::new(0),
            result: result.map(|s| s.to_string()).map_err(|s| s.to_string()),
        })
    }

    #[tokio::test]
    async fn confident_brain_response_skips_remote() {
        let brain = stub(Ok("The capital of France is Paris, a major European city known for the Eiffel Tower."));
        let remote = stub(Ok("unreached"));
        let router = Router::new(brain, Some(remote.clone()));
        let resp = router.chat(ChatRequest::default()).await.unwrap();
        assert!(resp.message.content.unwrap().contains("Paris"));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_confidence_escalates_to_remote() {
        let brain = stub(Ok(""));
        let remote = stub(Ok("Precise remote answer with full details."));
        let router = Router::new(brain, Some(remote.clone()));
        let resp = router.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.message.content.as_deref(), Some("Precise remote answer with full details."));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn low_confidence_with_no_remote_returns_brain_best_effort() {
        let brain = stub(Ok(""));
        let router = Router::new(brain, None);
        let resp = router.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.message.content.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn brain_error_falls_back_to_remote() {
        let brain = stub(Err("(status 500): boom"));
        let remote = stub(Ok("remote saved the day"));
        let router = Router::new(brain, Some(remote.clone()));
        let resp = router.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.message.content.as_deref(), Some("remote saved the day"));
    }

    #[tokio::test]
    async fn brain_error_with_no_remote_propagates() {
        let brain = stub(Err("(status 500): boom"));
        let router = Router::new(brain, None);
        assert!(router.chat(ChatRequest::default()).await.is_err());
    }
}
