use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A single LLM provider endpoint: where to send requests, which env var
/// carries the API key, and which model to request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
}

/// Known providers in the deterministic auto-detection order used when
/// `[fallbacks]` is absent from the config file: fixed order rather than
/// relying on environment iteration order, which is not deterministic.
pub const PROVIDER_AUTODETECT_ORDER: &[(&str, &str, &str)] = &[
    ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1"),
    ("anthropic", "ANTHROPIC_API_KEY", "https://api.anthropic.com/v1"),
    ("gemini", "GEMINI_API_KEY", "https://generativelanguage.googleapis.com/v1beta"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EgressMode {
    DevOpen,
    DenyAll,
    Allowlist,
}

impl Default for EgressMode {
    fn default() -> Self {
        EgressMode::DevOpen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub mode: EgressMode,
    pub domains: Vec<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            mode: EgressMode::DevOpen,
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub budget_chars: usize,
    pub trigger_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            budget_chars: 200_000,
            trigger_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub model_id: String,
    pub models_dir: String,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            models_dir: "models".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub confidence_threshold: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub audit_log_path: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            audit_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub primary: Option<ProviderConfig>,
    pub fallbacks: Vec<ProviderConfig>,
    pub egress: EgressConfig,
    pub compaction: CompactionConfig,
    pub brain: Option<BrainConfig>,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Loads config from `path` if present, falling back to `Default`
    /// otherwise, then layers environment overrides on top. Mirrors the
    /// teacher's `load_from`: a missing file is not an error, a malformed
    /// one is.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path.as_ref()) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.as_ref().display()))?;
        }

        config.apply_env_overrides();
        if config.primary.is_none() && config.fallbacks.is_empty() {
            let autodetected = Self::autodetect_providers();
            if let Some((first, rest)) = autodetected.split_first() {
                config.primary = Some(first.clone());
                config.fallbacks = rest.to_vec();
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Applies the environment variables documented in SPEC_FULL.md §D.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("AIGENT_BRAIN_MODEL_PATH") {
            if !path.is_empty() {
                let brain = self.brain.get_or_insert_with(BrainConfig::default);
                brain.models_dir = path;
            }
        }
        if let Ok(mode) = env::var("AIGENT_EGRESS_MODE") {
            self.egress.mode = match mode.as_str() {
                "deny-all" => EgressMode::DenyAll,
                "allowlist" => EgressMode::Allowlist,
                _ => EgressMode::DevOpen,
            };
        }
        if let Ok(list) = env::var("AIGENT_EGRESS_ALLOWLIST") {
            if !list.is_empty() {
                self.egress.domains = list.split(',').map(|s| s.trim().to_string()).collect();
            }
        }
    }

    /// Builds a provider chain from whichever API key env vars are set, in
    /// the fixed order openai → anthropic → gemini (SPEC_FULL.md §D).
    pub fn autodetect_providers() -> Vec<ProviderConfig> {
        PROVIDER_AUTODETECT_ORDER
            .iter()
            .filter_map(|(id, key_env, base_url)| {
                env::var(key_env).ok().filter(|v| !v.is_empty()).map(|_| ProviderConfig {
                    id: id.to_string(),
                    base_url: base_url.to_string(),
                    api_key_env: key_env.to_string(),
                    model: default_model_for(id).to_string(),
                })
            })
            .collect()
    }
}

fn default_model_for(provider_id: &str) -> &'static str {
    match provider_id {
        "openai" => "gpt-4o",
        "anthropic" => "claude-3-5-sonnet-latest",
        "gemini" => "gemini-1.5-pro",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn default_egress_mode_is_dev_open() {
        assert_eq!(EgressConfig::default().mode, EgressMode::DevOpen);
    }

    #[test]
    fn default_compaction_matches_spec() {
        let c = CompactionConfig::default();
        assert_eq!(c.budget_chars, 200_000);
        assert!((c.trigger_ratio - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn default_agent_matches_spec() {
        let a = AgentConfig::default();
        assert_eq!(a.max_iterations, 10);
        assert!((a.confidence_threshold - 0.7).abs() < f32::EPSILON);
    }

    // ── load_from ───────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_default() {
        let config = AppConfig::load_from("/nonexistent/path/does/not/exist.toml").unwrap();
        assert!((config.compaction.trigger_ratio - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn load_from_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "not valid = = toml").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.egress.mode = EgressMode::Allowlist;
        config.egress.domains = vec!["example.com".to_string()];
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.egress.mode, EgressMode::Allowlist);
        assert_eq!(loaded.egress.domains, vec!["example.com".to_string()]);
    }

    // ── provider autodetection order ───────────────────────────────────

    #[test]
    fn autodetect_order_is_openai_anthropic_gemini() {
        assert_eq!(PROVIDER_AUTODETECT_ORDER[0].0, "openai");
        assert_eq!(PROVIDER_AUTODETECT_ORDER[1].0, "anthropic");
        assert_eq!(PROVIDER_AUTODETECT_ORDER[2].0, "gemini");
    }
}
