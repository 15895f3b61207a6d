use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::FailoverReason;

/// Injectable time source so cooldown expiry is deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct CooldownEntry {
    last_reason: FailoverReason,
    consecutive_failures: u32,
    cooldown_until: DateTime<Utc>,
}

/// Per-provider exponential-backoff availability gate.
/// Thread-safe for concurrent reads and writes; one instance per process,
/// shared by a [`crate::fallback::FallbackChain`].
pub struct CooldownTracker {
    entries: Mutex<HashMap<String, CooldownEntry>>,
    clock: Box<dyn Clock>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(Box::new(SystemClock))
    }
}

impl CooldownTracker {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    pub fn is_available(&self, provider_id: &str) -> bool {
        let entries = self.entries.lock().expect("cooldown tracker poisoned");
        match entries.get(provider_id) {
            None => true,
            Some(entry) => entry.cooldown_until <= self.clock.now(),
        }
    }

    pub fn mark_failure(&self, provider_id: &str, reason: FailoverReason) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cooldown tracker poisoned");
        let entry = entries.entry(provider_id.to_string()).or_insert(CooldownEntry {
            last_reason: reason,
            consecutive_failures: 0,
            cooldown_until: now,
        });
        entry.consecutive_failures += 1;
        entry.last_reason = reason;
        entry.cooldown_until = now + cooldown_duration(reason, entry.consecutive_failures);
    }

    pub fn mark_success(&self, provider_id: &str) {
        let mut entries = self.entries.lock().expect("cooldown tracker poisoned");
        entries.remove(provider_id);
    }
}

/// Cooldown duration by failure reason and consecutive-failure count.
///
/// - `auth`: always 24h regardless of count.
/// - `billing`: {5h, 10h, 20h, 24h…} capped at 24h.
/// - others: {1m, 5m, 25m, 1h…} capped at 1h (geometric ×5, then capped).
/// - count = 0 → 0.
fn cooldown_duration(reason: FailoverReason, count: u32) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    match reason {
        FailoverReason::Auth => Duration::from_secs(24 * 3600),
        FailoverReason::Billing => {
            let hours = 5u64.saturating_mul(2u64.saturating_pow(count.saturating_sub(1)));
            Duration::from_secs(hours.min(24) * 3600)
        }
        _ => {
            let secs = 60u64.saturating_mul(5u64.saturating_pow(count.saturating_sub(1)));
            Duration::from_secs(secs.min(3600))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    struct FakeClock {
        now: RwLock<DateTime<Utc>>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self { now: RwLock::new(Utc::now()) })
        }
        fn advance(&self, d: Duration) {
            let mut n = self.now.write().unwrap();
            *n += chrono::Duration::from_std(d).unwrap();
        }
    }

    impl Clock for Arc<FakeClock> {
        fn now(&self) -> DateTime<Utc> {
            *self.as_ref().now.read().unwrap()
        }
    }

    #[test]
    fn available_with_no_entry() {
        let t = CooldownTracker::default();
        assert!(t.is_available("openai"));
    }

    #[test]
    fn unavailable_immediately_after_failure() {
        let t = CooldownTracker::default();
        t.mark_failure("openai", FailoverReason::RateLimit);
        assert!(!t.is_available("openai"));
    }

    #[test]
    fn success_clears_entry() {
        let t = CooldownTracker::default();
        t.mark_failure("openai", FailoverReason::RateLimit);
        t.mark_success("openai");
        assert!(t.is_available("openai"));
    }

    #[test]
    fn auth_cooldown_is_always_24h() {
        assert_eq!(cooldown_duration(FailoverReason::Auth, 1), Duration::from_secs(24 * 3600));
        assert_eq!(cooldown_duration(FailoverReason::Auth, 5), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn billing_cooldown_grows_and_caps_at_24h() {
        assert_eq!(cooldown_duration(FailoverReason::Billing, 1), Duration::from_secs(5 * 3600));
        assert_eq!(cooldown_duration(FailoverReason::Billing, 2), Duration::from_secs(10 * 3600));
        assert_eq!(cooldown_duration(FailoverReason::Billing, 3), Duration::from_secs(20 * 3600));
        assert_eq!(cooldown_duration(FailoverReason::Billing, 4), Duration::from_secs(24 * 3600));
        assert_eq!(cooldown_duration(FailoverReason::Billing, 10), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn other_reasons_cap_at_1h_and_are_monotonic() {
        let d1 = cooldown_duration(FailoverReason::RateLimit, 1);
        let d2 = cooldown_duration(FailoverReason::RateLimit, 2);
        let d3 = cooldown_duration(FailoverReason::RateLimit, 10);
        assert_eq!(d1, Duration::from_secs(60));
        assert_eq!(d2, Duration::from_secs(300));
        assert!(d2 >= d1);
        assert!(d3 >= d2);
        assert_eq!(d3, Duration::from_secs(3600));
    }

    #[test]
    fn cooldown_expires_after_advancing_clock() {
        let clock = FakeClock::new();
        let t = CooldownTracker::new(Box::new(Arc::clone(&clock)));
        t.mark_failure("openai", FailoverReason::RateLimit);
        assert!(!t.is_available("openai"));
        clock.advance(Duration::from_secs(61));
        assert!(t.is_available("openai"));
    }
}
