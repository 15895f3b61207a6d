use std::collections::HashSet;
use std::net::IpAddr;

use aigent_config::EgressMode;

/// Host allowlist / wildcard / mode decisions.
///
/// Domains are split once, at construction, into an exact-match set and a
/// suffix-match set (a pattern `"*.example.com"` becomes the suffix
/// `".example.com"`).
pub struct DomainMatcher {
    mode: EgressMode,
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl DomainMatcher {
    pub fn new(mode: EgressMode, domains: &[String]) -> Self {
        let mut exact = HashSet::new();
        let mut suffixes = Vec::new();
        for domain in domains {
            let lower = domain.to_lowercase();
            if let Some(suffix) = lower.strip_prefix("*.") {
                suffixes.push(format!(".{suffix}"));
            } else {
                exact.insert(lower);
            }
        }
        Self { mode, exact, suffixes }
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        match self.mode {
            EgressMode::DevOpen => true,
            EgressMode::DenyAll => false,
            EgressMode::Allowlist => {
                let lower = host.to_lowercase();
                self.exact.contains(&lower) || self.suffixes.iter().any(|s| lower.ends_with(s.as_str()))
            }
        }
    }
}

/// True for `"localhost"` and any IP parseable as loopback
/// (127.0.0.0/8, ::1).
pub fn is_localhost(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// True iff `KUBERNETES_SERVICE_HOST` is set or `/.dockerenv` exists.
/// Callers use this to decide whether to start the local forward proxy —
/// in-cluster enforcement is provided by a NetworkPolicy instead.
pub fn in_container() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() || std::path::Path::new("/.dockerenv").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_open_allows_everything() {
        let m = DomainMatcher::new(EgressMode::DevOpen, &[]);
        assert!(m.is_allowed("anything.example.com"));
    }

    #[test]
    fn deny_all_blocks_everything() {
        let m = DomainMatcher::new(EgressMode::DenyAll, &["allowed.com".to_string()]);
        assert!(!m.is_allowed("allowed.com"));
    }

    #[test]
    fn allowlist_exact_match() {
        let m = DomainMatcher::new(EgressMode::Allowlist, &["allowed.com".to_string()]);
        assert!(m.is_allowed("ALLOWED.com"));
        assert!(!m.is_allowed("blocked.com"));
    }

    #[test]
    fn allowlist_wildcard_suffix_match() {
        let m = DomainMatcher::new(EgressMode::Allowlist, &["*.example.com".to_string()]);
        assert!(m.is_allowed("api.example.com"));
        assert!(m.is_allowed("deep.api.example.com"));
        assert!(!m.is_allowed("example.com"));
        assert!(!m.is_allowed("notexample.com"));
    }

    #[test]
    fn is_localhost_recognizes_name_and_loopback_ips() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("example.com"));
        assert!(!is_localhost("8.8.8.8"));
    }
}
