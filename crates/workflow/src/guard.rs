//! Guard conditions: admission predicates evaluated against a token and the
//! shared topic context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::token::Token;

fn default_min_relevance() -> f64 {
    0.5
}

/// Admit a token only if the relevance of a topic reaches a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardCondition {
    #[serde(alias = "id")]
    pub guard_id: String,
    pub target_topic_id: String,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    /// Context key whose value overrides `min_relevance` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_key: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Read-only source of live topic relevance and thresholds.
pub trait ContextProvider: Send + Sync {
    fn relevance(&self, topic_id: &str) -> Option<f64>;

    fn threshold(&self, key: &str) -> Option<f64> {
        let _ = key;
        None
    }
}

/// Fixed relevance and threshold tables.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    relevance: HashMap<String, f64>,
    thresholds: HashMap<String, f64>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_relevance(mut self, topic_id: impl Into<String>, score: f64) -> Self {
        self.relevance.insert(topic_id.into(), score);
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, key: impl Into<String>, value: f64) -> Self {
        self.thresholds.insert(key.into(), value);
        self
    }
}

impl ContextProvider for StaticContext {
    fn relevance(&self, topic_id: &str) -> Option<f64> {
        self.relevance.get(topic_id).copied()
    }

    fn threshold(&self, key: &str) -> Option<f64> {
        self.thresholds.get(key).copied()
    }
}

/// Outcome of a guard evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Admit { score: f64, threshold: f64 },
    Reject { reason: String, score: f64, threshold: f64 },
}

impl GuardVerdict {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    pub fn score(&self) -> f64 {
        match self {
            Self::Admit { score, .. } | Self::Reject { score, .. } => *score,
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            Self::Admit { threshold, .. } | Self::Reject { threshold, .. } => *threshold,
        }
    }
}

impl GuardCondition {
    pub fn new(
        guard_id: impl Into<String>,
        target_topic_id: impl Into<String>,
        min_relevance: f64,
    ) -> Self {
        Self {
            guard_id: guard_id.into(),
            target_topic_id: target_topic_id.into(),
            min_relevance,
            threshold_key: None,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_threshold_key(mut self, key: impl Into<String>) -> Self {
        self.threshold_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Effective threshold: the context value for `threshold_key`, else
    /// `min_relevance`.
    pub fn threshold(&self, context: &dyn ContextProvider) -> f64 {
        self.threshold_key
            .as_deref()
            .and_then(|key| context.threshold(key))
            .unwrap_or(self.min_relevance)
    }

    /// Relevance of the target topic: live context first, then the token's
    /// own topic weights, else zero.
    pub fn score(&self, token: &Token, context: &dyn ContextProvider) -> f64 {
        context
            .relevance(&self.target_topic_id)
            .or_else(|| token.topic_weight(&self.target_topic_id))
            .unwrap_or(0.0)
    }

    /// Pure predicate; neither the token nor the context is modified.
    pub fn evaluate(&self, token: &Token, context: &dyn ContextProvider) -> GuardVerdict {
        let score = self.score(token, context);
        let threshold = self.threshold(context);

        if score >= threshold {
            GuardVerdict::Admit { score, threshold }
        } else {
            GuardVerdict::Reject {
                reason: format!(
                    "relevance of '{}' is {score} (< {threshold})",
                    self.target_topic_id
                ),
                score,
                threshold,
            }
        }
    }

    /// Thresholds must be finite and inside `[0.0, 1.0]`.
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.guard_id.is_empty() {
            return Err("guard id is empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(format!("min_relevance {} outside [0, 1]", self.min_relevance));
        }
        Ok(())
    }
}
