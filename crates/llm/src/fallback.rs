use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::client::LlmClient;
use crate::cooldown::CooldownTracker;
use crate::error::{ErrorClassifier, FailoverError};
use crate::message::{ChatRequest, ChatResponse, StreamDelta};

pub struct Candidate {
    pub provider_id: String,
    pub model_id: String,
    pub client: Arc<dyn LlmClient>,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("cancelled")]
    Cancelled,
    #[error("all candidates in cooldown")]
    AllInCooldown,
    #[error("all candidates exhausted: {0:?}")]
    FallbackExhausted(Vec<FailoverError>),
    #[error(transparent)]
    Failover(#[from] FailoverError),
}

/// Ordered list of provider candidates tried in declared order. A chain of
/// one candidate is raw pass-through: the caller's error identity is
/// preserved rather than being wrapped in the cooldown machinery.
pub struct FallbackChain {
    candidates: Vec<Candidate>,
    cooldown: Arc<CooldownTracker>,
}

impl FallbackChain {
    pub fn new(candidates: Vec<Candidate>, cooldown: Arc<CooldownTracker>) -> Self {
        Self { candidates, cooldown }
    }

    pub fn model_id(&self) -> &str {
        self.candidates.first().map(|c| c.model_id.as_str()).unwrap_or("")
    }

    pub async fn chat(&self, req: ChatRequest, cancel: &CancellationToken) -> Result<ChatResponse, ChainError> {
        if self.candidates.len() == 1 {
            let candidate = &self.candidates[0];
            return candidate.client.chat(req).await.map_err(|e| {
                ChainError::Failover(ErrorClassifier::classify(&e, &candidate.provider_id, &candidate.model_id))
            });
        }

        if cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }

        let mut errors = Vec::new();
        let mut attempted_any = false;

        for candidate in &self.candidates {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            if !self.cooldown.is_available(&candidate.provider_id) {
                continue;
            }
            attempted_any = true;

            match candidate.client.chat(req.clone()).await {
                Ok(resp) => {
                    self.cooldown.mark_success(&candidate.provider_id);
                    return Ok(resp);
                }
                Err(e) => {
                    let classified = ErrorClassifier::classify(&e, &candidate.provider_id, &candidate.model_id);
                    if !classified.retriable() {
                        return Err(ChainError::Failover(classified));
                    }
                    self.cooldown.mark_failure(&candidate.provider_id, classified.reason);
                    errors.push(classified);
                }
            }
        }

        if attempted_any {
            Err(ChainError::FallbackExhausted(errors))
        } else {
            Err(ChainError::AllInCooldown)
        }
    }

    pub async fn chat_stream(
        &self,
        req: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamDelta>, ChainError> {
        if self.candidates.len() == 1 {
            let candidate = &self.candidates[0];
            return candidate.client.chat_stream(req).await.map_err(|e| {
                ChainError::Failover(ErrorClassifier::classify(&e, &candidate.provider_id, &candidate.model_id))
            });
        }

        if cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }

        let mut errors = Vec::new();
        let mut attempted_any = false;

        for candidate in &self.candidates {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            if !self.cooldown.is_available(&candidate.provider_id) {
                continue;
            }
            attempted_any = true;

            match candidate.client.chat_stream(req.clone()).await {
                Ok(rx) => {
                    self.cooldown.mark_success(&candidate.provider_id);
                    return Ok(rx);
                }
                Err(e) => {
                    let classified = ErrorClassifier::classify(&e, &candidate.provider_id, &candidate.model_id);
                    if !classified.retriable() {
                        return Err(ChainError::Failover(classified));
                    }
                    self.cooldown.mark_failure(&candidate.provider_id, classified.reason);
                    errors.push(classified);
                }
            }
        }

        if attempted_any {
            Err(ChainError::FallbackExhausted(errors))
        } else {
            Err(ChainError::AllInCooldown)
        }
    }
}

/// Lets a chain stand in anywhere a single [`LlmClient`] is expected (the
/// Router's brain/remote slots, direct wiring when routing isn't wanted).
/// The trait carries no cancellation token, so calls through this impl run
/// with a fresh, never-cancelled one — callers needing cancellation use
/// [`FallbackChain::chat`]/[`FallbackChain::chat_stream`] directly.
#[async_trait]
impl LlmClient for FallbackChain {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let cancel = CancellationToken::new();
        self.chat(req, &cancel).await.map_err(anyhow::Error::from)
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
        let cancel = CancellationToken::new();
        self.chat_stream(req, &cancel).await.map_err(anyhow::Error::from)
    }

    fn model_id(&self) -> &str {
        self.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatMessage, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        model: String,
        calls: AtomicUsize,
        outcome: StubOutcome,
    }

    enum StubOutcome {
        Ok(String),
        Err(String),
    }

    #[async_trait]
    impl LlmClient for StubClient {
        async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                StubOutcome::Ok(content) => Ok(ChatResponse {
                    message: ChatMessage::assistant(content.clone()),
                    finish_reason: "stop".to_string(),
                    usage: Some(Usage::default()),
                }),
                StubOutcome::Err(msg) => Err(anyhow::anyhow!(msg.clone())),
            }
        }

        async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<mpsc::Receiver<StreamDelta>> {
            unimplemented!("not exercised in these tests")
        }

        fn model_id(&self) -> &str {
            &self.model
        }
    }

    fn candidate(provider: &str, outcome: StubOutcome) -> (Candidate, Arc<StubClient>) {
        let client = Arc::new(StubClient { model: format!("{provider}-model"), calls: AtomicUsize::new(0), outcome });
        (
            Candidate { provider_id: provider.to_string(), model_id: client.model.clone(), client: client.clone() },
            client,
        )
    }

    #[tokio::test]
    async fn single_candidate_delegates_raw_error() {
        let (candidate, _) = candidate("openai", StubOutcome::Err("(status 401): nope".to_string()));
        let chain = FallbackChain::new(vec![candidate], Arc::new(CooldownTracker::default()));
        let err = chain.chat(ChatRequest::default(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ChainError::Failover(_)));
    }

    #[tokio::test]
    async fn retriable_failure_advances_to_next_candidate() {
        let (a, _) = candidate("openai", StubOutcome::Err("(status 429): rate limited".to_string()));
        let (b, _) = candidate("anthropic", StubOutcome::Ok("ok from claude".to_string()));
        let chain = FallbackChain::new(vec![a, b], Arc::new(CooldownTracker::default()));
        let resp = chain.chat(ChatRequest::default(), &CancellationToken::new()).await.unwrap();
        assert_eq!(resp.message.content.as_deref(), Some("ok from claude"));
    }

    #[tokio::test]
    async fn non_retriable_failure_aborts_without_trying_next() {
        let (a, a_client) = candidate("openai", StubOutcome::Err("(status 401): unauthorized".to_string()));
        let (b, b_client) = candidate("anthropic", StubOutcome::Ok("unreached".to_string()));
        let chain = FallbackChain::new(vec![a, b], Arc::new(CooldownTracker::default()));
        let err = chain.chat(ChatRequest::default(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ChainError::Failover(_)));
        assert_eq!(a_client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_in_cooldown_skips_every_candidate() {
        let cooldown = Arc::new(CooldownTracker::default());
        cooldown.mark_failure("openai", crate::error::FailoverReason::RateLimit);
        cooldown.mark_failure("anthropic", crate::error::FailoverReason::RateLimit);
        let (a, a_client) = candidate("openai", StubOutcome::Ok("x".to_string()));
        let (b, _) = candidate("anthropic", StubOutcome::Ok("y".to_string()));
        let chain = FallbackChain::new(vec![a, b], cooldown);
        let err = chain.chat(ChatRequest::default(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ChainError::AllInCooldown));
        assert_eq!(a_client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_context_returns_cancellation_without_calling_clients() {
        let (a, a_client) = candidate("openai", StubOutcome::Ok("x".to_string()));
        let (b, _) = candidate("anthropic", StubOutcome::Ok("y".to_string()));
        let chain = FallbackChain::new(vec![a, b], Arc::new(CooldownTracker::default()));
        let token = CancellationToken::new();
        token.cancel();
        let err = chain.chat(ChatRequest::default(), &token).await.unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
        assert_eq!(a_client.calls.load(Ordering::SeqCst), 0);
    }
}
