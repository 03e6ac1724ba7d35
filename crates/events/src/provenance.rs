//! Provenance entries: one record per check performed on a token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntryId, TaskId, TokenId, TraceId};

/// Which side of an action a schema validation ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Output,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// The kind of check an entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// Token content checked against a token spec.
    Validation { stage: Stage, spec_id: String },
    /// Guard condition evaluated against the token.
    Guard {
        guard_id: String,
        topic: String,
        score: f64,
        threshold: f64,
    },
    /// AND-join released a complete input set.
    Join { arcs: Vec<String> },
    /// Task fired and emitted an output token.
    Firing,
    /// Control entered a sub-process.
    Call { process_id: String, depth: usize },
    /// Control returned from a sub-process.
    Return { process_id: String, depth: usize },
}

impl CheckKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Guard { .. } => "guard",
            Self::Join { .. } => "join",
            Self::Firing => "firing",
            Self::Call { .. } => "call",
            Self::Return { .. } => "return",
        }
    }
}

/// Result of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Rejected { reason: String },
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// One append-only audit record.
///
/// `seq` orders entries within a trace. It is assigned by the run that
/// produced the entry and is strictly increasing per trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub entry_id: EntryId,
    pub seq: u64,
    pub trace_id: TraceId,
    pub token_id: Option<TokenId>,
    pub task_id: TaskId,
    pub check: CheckKind,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl ProvenanceEntry {
    /// Record a passed check.
    pub fn passed(
        seq: u64,
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        check: CheckKind,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            seq,
            trace_id,
            token_id: None,
            task_id: task_id.into(),
            check,
            outcome: Outcome::Passed,
            timestamp: Utc::now(),
        }
    }

    /// Record a rejected check.
    pub fn rejected(
        seq: u64,
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        check: CheckKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            outcome: Outcome::Rejected {
                reason: reason.into(),
            },
            ..Self::passed(seq, trace_id, task_id, check)
        }
    }

    /// Attach the token the check ran against.
    #[must_use]
    pub fn with_token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    pub fn is_rejected(&self) -> bool {
        !self.outcome.is_passed()
    }

    /// Guard id, when this entry records a guard evaluation.
    pub fn guard_id(&self) -> Option<&str> {
        match &self.check {
            CheckKind::Guard { guard_id, .. } => Some(guard_id),
            _ => None,
        }
    }
}
