//! Engine and compiler configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::place::JoinPolicy;

/// What a run does when one branch is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every in-flight firing and surface the error.
    #[default]
    AbortRun,
    /// Drop only the rejected branch; siblings keep running.
    ContinueBranches,
}

/// How many schema violations a validation reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    FailFast,
    Aggregate,
}

/// Bounded retries with exponential backoff for task actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Delay after the given failed attempt (1-based): doubles each time,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Options for [`compile_with`](crate::compiler::compile_with).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Accept links between different specs when their fields line up.
    pub structural_compatibility: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            structural_compatibility: true,
        }
    }
}

/// Runtime configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub failure_policy: FailurePolicy,
    pub validation_mode: ValidationMode,
    /// Policy for repeated arrivals on an already filled join arc.
    pub join_policy: JoinPolicy,
    /// Fail an incomplete join after this many milliseconds. Off by default.
    pub join_timeout_ms: Option<u64>,
    /// Per-attempt timeout for native actions.
    pub action_timeout_ms: Option<u64>,
    /// Timeout for a whole sub-process call.
    pub call_timeout_ms: Option<u64>,
    pub max_concurrent_firings: usize,
    pub max_call_depth: usize,
    /// Used for tasks that declare no retry policy of their own.
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::AbortRun,
            validation_mode: ValidationMode::FailFast,
            join_policy: JoinPolicy::RejectDuplicate,
            join_timeout_ms: None,
            action_timeout_ms: None,
            call_timeout_ms: None,
            max_concurrent_firings: 16,
            max_call_depth: 8,
            default_retry: RetryPolicy::default(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Document(#[from] tbcspn_core::Error),

    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error("invalid engine configuration: {reason}")]
    Invalid { reason: String },
}

impl EngineConfig {
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    #[must_use]
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = Some(duration_ms(timeout));
        self
    }

    #[must_use]
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout_ms = Some(duration_ms(timeout));
        self
    }

    #[must_use]
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    #[must_use]
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_ms.map(Duration::from_millis)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Load from a JSON, YAML or TOML file. Missing keys take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = tbcspn_core::load_document(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `TBCSPN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("TBCSPN_FAILURE_POLICY") {
            config.failure_policy = parse_enum("TBCSPN_FAILURE_POLICY", &value)?;
        }
        if let Some(value) = lookup("TBCSPN_VALIDATION_MODE") {
            config.validation_mode = parse_enum("TBCSPN_VALIDATION_MODE", &value)?;
        }
        if let Some(value) = lookup("TBCSPN_JOIN_POLICY") {
            config.join_policy = parse_enum("TBCSPN_JOIN_POLICY", &value)?;
        }
        if let Some(value) = lookup("TBCSPN_JOIN_TIMEOUT_MS") {
            config.join_timeout_ms = Some(parse_number("TBCSPN_JOIN_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("TBCSPN_ACTION_TIMEOUT_MS") {
            config.action_timeout_ms = Some(parse_number("TBCSPN_ACTION_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("TBCSPN_CALL_TIMEOUT_MS") {
            config.call_timeout_ms = Some(parse_number("TBCSPN_CALL_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("TBCSPN_MAX_CONCURRENT_FIRINGS") {
            config.max_concurrent_firings = parse_number("TBCSPN_MAX_CONCURRENT_FIRINGS", &value)?;
        }
        if let Some(value) = lookup("TBCSPN_MAX_CALL_DEPTH") {
            config.max_call_depth = parse_number("TBCSPN_MAX_CALL_DEPTH", &value)?;
        }
        if let Some(value) = lookup("TBCSPN_MAX_ATTEMPTS") {
            config.default_retry.max_attempts = parse_number("TBCSPN_MAX_ATTEMPTS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_firings == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_concurrent_firings must be at least 1".to_string(),
            });
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_call_depth must be at least 1".to_string(),
            });
        }
        if self.default_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "default_retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_enum<T: serde::de::DeserializeOwned>(var: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).map_err(|_| {
        ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }
    })
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.failure_policy, FailurePolicy::AbortRun);
        assert_eq!(config.validation_mode, ValidationMode::FailFast);
        assert_eq!(config.join_policy, JoinPolicy::RejectDuplicate);
        assert!(config.join_timeout().is_none());
        assert_eq!(config.max_concurrent_firings, 16);
        assert!(CompileOptions::default().structural_compatibility);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::new(5).with_backoff(100, 350);
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TBCSPN_FAILURE_POLICY", "continue_branches"),
            ("TBCSPN_JOIN_TIMEOUT_MS", "250"),
            ("TBCSPN_MAX_CALL_DEPTH", "3"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|v| vars.get(v).map(|s| s.to_string())).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::ContinueBranches);
        assert_eq!(config.join_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_call_depth, 3);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let bad_enum = EngineConfig::from_lookup(|v| {
            (v == "TBCSPN_VALIDATION_MODE").then(|| "sometimes".to_string())
        });
        assert!(matches!(bad_enum, Err(ConfigError::InvalidEnv { .. })));

        let zero = EngineConfig::from_lookup(|v| {
            (v == "TBCSPN_MAX_CONCURRENT_FIRINGS").then(|| "0".to_string())
        });
        assert!(matches!(zero, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_from_toml_file_with_partial_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "validation_mode = \"aggregate\"\njoin_policy = \"queue\"\n\n[default_retry]\nmax_attempts = 3\n"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.validation_mode, ValidationMode::Aggregate);
        assert_eq!(config.join_policy, JoinPolicy::Queue);
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.default_retry.initial_backoff_ms, 100);
        assert_eq!(config.max_call_depth, 8);
    }
}
