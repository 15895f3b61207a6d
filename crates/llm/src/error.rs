use thiserror::Error;

/// Taxonomy a raw provider error is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverReason {
    Auth,
    RateLimit,
    Billing,
    Timeout,
    Overloaded,
    Format,
    Unknown,
}

impl FailoverReason {
    /// `retriable = reason ∉ {auth, format, billing}`.
    pub fn retriable(self) -> bool {
        !matches!(self, FailoverReason::Auth | FailoverReason::Format | FailoverReason::Billing)
    }
}

#[derive(Debug, Error)]
pub struct FailoverError {
    pub reason: FailoverReason,
    pub provider_id: String,
    pub model_id: String,
    pub status: Option<u16>,
    #[source]
    pub cause: anyhow::Error,
}

impl std::fmt::Display for FailoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            Some(code) => format!(" (status {code})"),
            None => String::new(),
        };
        write!(f, "{}/{} error{status}: {:?}: {}", self.provider_id, self.model_id, self.reason, self.cause)
    }
}

impl FailoverError {
    pub fn retriable(&self) -> bool {
        self.reason.retriable()
    }
}

/// Classifies a raw error message into a [`FailoverError`].
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Extracts the first `(status NNN)` substring and maps it by table;
    /// falls back to lowercase substring matching on the message.
    pub fn classify(raw: &anyhow::Error, provider_id: &str, model_id: &str) -> FailoverError {
        let message = raw.to_string();
        let status = extract_status(&message);
        let reason = match status {
            Some(code) => reason_from_status(code),
            None => reason_from_message(&message.to_lowercase()),
        };

        FailoverError {
            reason,
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            status,
            cause: anyhow::anyhow!(message),
        }
    }
}

fn extract_status(message: &str) -> Option<u16> {
    let start = message.find("(status ")?;
    let rest = &message[start + "(status ".len()..];
    let end = rest.find(')')?;
    rest[..end].trim().parse::<u16>().ok()
}

fn reason_from_status(status: u16) -> FailoverReason {
    match status {
        400 => FailoverReason::Format,
        401 | 403 => FailoverReason::Auth,
        402 => FailoverReason::Billing,
        408 | 504 => FailoverReason::Timeout,
        429 => FailoverReason::RateLimit,
        500 | 502 | 503 | 529 => FailoverReason::Overloaded,
        _ => FailoverReason::Unknown,
    }
}

fn reason_from_message(lower: &str) -> FailoverReason {
    if contains_any(lower, &["unauthorized", "authentication", "invalid api key", "permission denied"]) {
        FailoverReason::Auth
    } else if contains_any(lower, &["rate limit", "too many requests"]) {
        FailoverReason::RateLimit
    } else if contains_any(lower, &["timeout", "deadline exceeded", "context deadline"]) {
        FailoverReason::Timeout
    } else if contains_any(lower, &["overloaded", "service unavailable", "bad gateway"]) {
        FailoverReason::Overloaded
    } else {
        FailoverReason::Unknown
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(msg: &str) -> anyhow::Error {
        anyhow::anyhow!(msg.to_string())
    }

    // ── status-code mapping ─────────────────────────────────────────────

    #[test]
    fn status_400_maps_to_format() {
        let e = ErrorClassifier::classify(&err("openai error (status 400): bad request"), "openai", "gpt-4o");
        assert_eq!(e.reason, FailoverReason::Format);
        assert!(!e.retriable());
    }

    #[test]
    fn status_401_maps_to_auth() {
        let e = ErrorClassifier::classify(&err("(status 401): unauthorized"), "openai", "gpt-4o");
        assert_eq!(e.reason, FailoverReason::Auth);
        assert!(!e.retriable());
    }

    #[test]
    fn status_429_maps_to_rate_limit_and_is_retriable() {
        let e = ErrorClassifier::classify(&err("openai error (status 429): rate limited"), "openai", "gpt-4o");
        assert_eq!(e.reason, FailoverReason::RateLimit);
        assert!(e.retriable());
    }

    #[test]
    fn status_529_maps_to_overloaded() {
        let e = ErrorClassifier::classify(&err("(status 529): overloaded_error"), "anthropic", "claude");
        assert_eq!(e.reason, FailoverReason::Overloaded);
    }

    #[test]
    fn unmapped_status_is_unknown() {
        let e = ErrorClassifier::classify(&err("(status 999): weird"), "p", "m");
        assert_eq!(e.reason, FailoverReason::Unknown);
    }

    // ── message pattern matching ────────────────────────────────────────

    #[test]
    fn message_pattern_auth() {
        let e = ErrorClassifier::classify(&err("Invalid API Key provided"), "p", "m");
        assert_eq!(e.reason, FailoverReason::Auth);
    }

    #[test]
    fn message_pattern_timeout() {
        let e = ErrorClassifier::classify(&err("context deadline exceeded while waiting"), "p", "m");
        assert_eq!(e.reason, FailoverReason::Timeout);
    }

    #[test]
    fn message_with_no_pattern_is_unknown() {
        let e = ErrorClassifier::classify(&err("something strange happened"), "p", "m");
        assert_eq!(e.reason, FailoverReason::Unknown);
    }

    // ── retriable invariant ────────────────────────────────

    #[test]
    fn retriable_iff_not_policy_reason() {
        for reason in [
            FailoverReason::Auth,
            FailoverReason::RateLimit,
            FailoverReason::Billing,
            FailoverReason::Timeout,
            FailoverReason::Overloaded,
            FailoverReason::Format,
            FailoverReason::Unknown,
        ] {
            let is_policy = matches!(reason, FailoverReason::Auth | FailoverReason::Format | FailoverReason::Billing);
            assert_eq!(reason.retriable(), !is_policy);
        }
    }
}
