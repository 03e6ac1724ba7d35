//! Runtime error types for the workflow crate.
//!
//! Every variant names the trace and the task it happened at.

use itertools::Itertools;
use tbcspn_events::{Stage, TaskId, TraceId};
use thiserror::Error;

use crate::place::JoinError;
use crate::schema::ValidationError;
use crate::task::TaskState;

/// Result type alias for workflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a run.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{stage} validation failed at task '{task_id}' (trace {trace_id}): {}", .violations.iter().join("; "))]
    SchemaViolation {
        trace_id: TraceId,
        task_id: TaskId,
        stage: Stage,
        violations: Vec<ValidationError>,
    },

    #[error("guard '{guard_id}' rejected token at task '{task_id}' (trace {trace_id}): relevance of '{topic}' is {score} (< {threshold})")]
    GuardRejection {
        trace_id: TraceId,
        task_id: TaskId,
        guard_id: String,
        topic: String,
        score: f64,
        threshold: f64,
    },

    #[error("action of task '{task_id}' failed after {attempts} attempt(s) (trace {trace_id}): {message}")]
    AgentExecution {
        trace_id: TraceId,
        task_id: TaskId,
        attempts: u32,
        message: String,
    },

    #[error("action of task '{task_id}' timed out after {timeout_ms}ms on attempt {attempts} (trace {trace_id})")]
    ActionTimeout {
        trace_id: TraceId,
        task_id: TaskId,
        attempts: u32,
        timeout_ms: u64,
    },

    #[error("join error at task '{task_id}' (trace {trace_id}): {source}")]
    Join {
        trace_id: TraceId,
        task_id: TaskId,
        source: JoinError,
    },

    #[error("conflicting values for field '{field}' when merging inputs of task '{task_id}' (trace {trace_id})")]
    MergeConflict {
        trace_id: TraceId,
        task_id: TaskId,
        field: String,
    },

    #[error("sub-process '{process_id}' called by task '{task_id}' at depth {depth} failed (trace {trace_id}): {source}")]
    SubprocessFailed {
        trace_id: TraceId,
        task_id: TaskId,
        process_id: String,
        depth: usize,
        source: Box<Error>,
    },

    #[error("sub-process '{process_id}' called by task '{task_id}' produced no terminal token (trace {trace_id})")]
    NoTerminalToken {
        trace_id: TraceId,
        task_id: TaskId,
        process_id: String,
    },

    #[error("call from task '{task_id}' into '{process_id}' exceeds max call depth {max_depth} (trace {trace_id})")]
    CallDepthExceeded {
        trace_id: TraceId,
        task_id: TaskId,
        process_id: String,
        max_depth: usize,
    },

    #[error("provenance for task '{task_id}' could not be recorded (trace {trace_id}): {source}")]
    Audit {
        trace_id: TraceId,
        task_id: TaskId,
        source: tbcspn_events::Error,
    },

    #[error("task '{task_id}' is not part of the process (trace {trace_id})")]
    UnknownTask { trace_id: TraceId, task_id: TaskId },

    #[error("task '{task_id}' cannot move from {from} to {to} (trace {trace_id})")]
    InvalidTransition {
        trace_id: TraceId,
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl Error {
    /// Create a schema violation error.
    pub fn schema_violation(
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        stage: Stage,
        violations: Vec<ValidationError>,
    ) -> Self {
        Self::SchemaViolation {
            trace_id,
            task_id: task_id.into(),
            stage,
            violations,
        }
    }

    /// Create an agent execution error.
    pub fn agent_execution(
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::AgentExecution {
            trace_id,
            task_id: task_id.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a join error.
    pub fn join(trace_id: TraceId, task_id: impl Into<TaskId>, source: JoinError) -> Self {
        Self::Join {
            trace_id,
            task_id: task_id.into(),
            source,
        }
    }

    /// Create an audit error.
    pub fn audit(
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        source: tbcspn_events::Error,
    ) -> Self {
        Self::Audit {
            trace_id,
            task_id: task_id.into(),
            source,
        }
    }

    /// Create a sub-process failure wrapping the nested error.
    pub fn subprocess_failed(
        trace_id: TraceId,
        task_id: impl Into<TaskId>,
        process_id: impl Into<String>,
        depth: usize,
        source: Error,
    ) -> Self {
        Self::SubprocessFailed {
            trace_id,
            task_id: task_id.into(),
            process_id: process_id.into(),
            depth,
            source: Box::new(source),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        match self {
            Self::SchemaViolation { trace_id, .. }
            | Self::GuardRejection { trace_id, .. }
            | Self::AgentExecution { trace_id, .. }
            | Self::ActionTimeout { trace_id, .. }
            | Self::Join { trace_id, .. }
            | Self::MergeConflict { trace_id, .. }
            | Self::SubprocessFailed { trace_id, .. }
            | Self::NoTerminalToken { trace_id, .. }
            | Self::CallDepthExceeded { trace_id, .. }
            | Self::Audit { trace_id, .. }
            | Self::UnknownTask { trace_id, .. }
            | Self::InvalidTransition { trace_id, .. } => *trace_id,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::SchemaViolation { task_id, .. }
            | Self::GuardRejection { task_id, .. }
            | Self::AgentExecution { task_id, .. }
            | Self::ActionTimeout { task_id, .. }
            | Self::Join { task_id, .. }
            | Self::MergeConflict { task_id, .. }
            | Self::SubprocessFailed { task_id, .. }
            | Self::NoTerminalToken { task_id, .. }
            | Self::CallDepthExceeded { task_id, .. }
            | Self::Audit { task_id, .. }
            | Self::UnknownTask { task_id, .. }
            | Self::InvalidTransition { task_id, .. } => task_id,
        }
    }

    pub fn guard_id(&self) -> Option<&str> {
        match self {
            Self::GuardRejection { guard_id, .. } => Some(guard_id),
            Self::SubprocessFailed { source, .. } => source.guard_id(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ActionTimeout { .. } | Self::Audit { .. })
    }

    /// A token was refused at a transition boundary.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::SchemaViolation { .. } | Self::GuardRejection { .. } | Self::MergeConflict { .. }
        )
    }

    /// The innermost error, unwinding sub-process failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::SubprocessFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Sub-process depth at which the innermost error happened.
    pub fn failure_depth(&self) -> usize {
        match self {
            Self::SubprocessFailed { source, .. } => source.failure_depth().saturating_add(1),
            _ => 0,
        }
    }
}
