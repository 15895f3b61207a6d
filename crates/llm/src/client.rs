use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{ChatRequest, ChatResponse, StreamDelta};

/// The only capability boundary for talking to an LLM. OAuth, the Responses
/// API, Router, FallbackChain and the local brain client are all variants
/// that implement this same trait — callers never match on a concrete
/// provider type.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Streams deltas on a bounded channel (16-32 capacity).
    /// The returned receiver yields content chunks, then tool-call deltas,
    /// then exactly one terminal delta with `done = true`.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>>;

    fn model_id(&self) -> &str;
}

/// Bounded-buffer size used by every `chat_stream` implementation in this
/// crate,.
pub const STREAM_BUFFER: usize = 24;
