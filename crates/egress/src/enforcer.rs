use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::{DomainMatcher, is_localhost};

#[derive(Debug, Error)]
#[error("egress blocked: domain {host} not in allowlist (mode={mode})")]
pub struct EgressBlocked {
    pub host: String,
    pub mode: &'static str,
}

/// Callback fired once per egress decision, carrying the host and whether
/// it was allowed.
pub type OnAttempt = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Wraps an HTTP round-trip function with the allowlist check. For every
/// outbound request: extract the hostname (lowercase, port-stripped);
/// localhost always passes; otherwise consult the [`DomainMatcher`] and fire
/// `on_attempt` before deciding.
pub struct EgressEnforcer {
    matcher: DomainMatcher,
    mode_label: &'static str,
    on_attempt: Option<OnAttempt>,
}

impl EgressEnforcer {
    pub fn new(matcher: DomainMatcher, mode_label: &'static str) -> Self {
        Self { matcher, mode_label, on_attempt: None }
    }

    pub fn with_on_attempt(mut self, cb: OnAttempt) -> Self {
        self.on_attempt = Some(cb);
        self
    }

    fn host_of(url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        parsed.host_str().map(|h| h.to_lowercase())
    }

    fn check(&self, host: &str) -> bool {
        if is_localhost(host) {
            return true;
        }
        self.matcher.is_allowed(host)
    }

    /// Runs `base` only if the request's URL clears the allowlist; otherwise
    /// returns an [`EgressBlocked`] error without invoking `base`.
    pub async fn call<F, Fut, T>(&self, url: &str, base: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let host = Self::host_of(url).unwrap_or_default();
        let allowed = self.check(&host);
        if let Some(cb) = &self.on_attempt {
            cb(&host, allowed);
        }
        if !allowed {
            anyhow::bail!(EgressBlocked { host, mode: self.mode_label });
        }
        base().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_config::EgressMode;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn localhost_always_passes_even_in_deny_all() {
        let enforcer = EgressEnforcer::new(DomainMatcher::new(EgressMode::DenyAll, &[]), "deny-all");
        let result = enforcer.call("http://localhost:8080/x", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn allowed_domain_invokes_base() {
        let matcher = DomainMatcher::new(EgressMode::Allowlist, &["allowed.com".to_string()]);
        let enforcer = EgressEnforcer::new(matcher, "allowlist");
        let result = enforcer.call("https://allowed.com/path?x=1", || async { Ok("ok") }).await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn blocked_domain_never_invokes_base() {
        let matcher = DomainMatcher::new(EgressMode::Allowlist, &["allowed.com".to_string()]);
        let enforcer = EgressEnforcer::new(matcher, "allowlist");
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let result = enforcer
            .call("https://blocked.com/", || async move {
                called2.store(true, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;
        assert!(result.is_err());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn on_attempt_observes_host_and_decision() {
        let matcher = DomainMatcher::new(EgressMode::Allowlist, &["allowed.com".to_string()]);
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        let enforcer = EgressEnforcer::new(matcher, "allowlist")
            .with_on_attempt(Arc::new(move |host, allowed| *seen2.lock().unwrap() = Some((host.to_string(), allowed))));
        let _ = enforcer.call("https://blocked.com/", || async { Ok(()) }).await;
        assert_eq!(*seen.lock().unwrap(), Some(("blocked.com".to_string(), false)));
    }
}
