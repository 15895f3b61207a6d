//! LLM provider layer: the chat message/tool-call data model, the
//! capability-boundary client trait, failover (error classification,
//! cooldown circuit breaking, ordered fallback), confidence-gated routing
//! between a local brain and a remote model, and the local model catalogue.

pub mod client;
pub mod confidence;
pub mod cooldown;
pub mod error;
pub mod fallback;
pub mod json_extract;
pub mod message;
pub mod models;
pub mod providers;
pub mod responses_stream;
pub mod router;

pub use client::{LlmClient, STREAM_BUFFER};
pub use confidence::ConfidenceScorer;
pub use cooldown::{Clock, CooldownTracker, SystemClock};
pub use error::{ErrorClassifier, FailoverError, FailoverReason};
pub use fallback::{Candidate, ChainError, FallbackChain};
pub use json_extract::{extract_json_objects, extract_json_output};
pub use message::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, StreamDelta, ToolCall, ToolCallDelta, ToolCallFunction,
    ToolDefinition, Usage,
};
pub use models::{ModelInfo, default_registry, download_model};
pub use providers::OpenAiCompatibleClient;
pub use responses_stream::ResponsesStreamParser;
pub use router::{DEFAULT_CONFIDENCE_THRESHOLD, Router, RouterError};
