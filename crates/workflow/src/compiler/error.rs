//! Compile-time diagnostics.

use itertools::Itertools;
use tbcspn_events::TaskId;
use thiserror::Error;

/// One structural problem found while compiling a process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("process has no tasks")]
    EmptyProcess,

    #[error("task '{task_id}' is declared more than once")]
    DuplicateTask { task_id: TaskId },

    #[error("link {from} -> {to} references unknown task '{missing}'")]
    DanglingLink {
        from: TaskId,
        to: TaskId,
        missing: TaskId,
    },

    #[error("link {from} -> {to} is declared more than once")]
    DuplicateLink { from: TaskId, to: TaskId },

    #[error("cycle detected: {}", .cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<TaskId> },

    #[error("link {from} -> {to}: output '{output_spec}' does not fit input '{input_spec}': {reason}")]
    SpecChainMismatch {
        from: TaskId,
        to: TaskId,
        output_spec: String,
        input_spec: String,
        reason: String,
    },

    #[error("task '{task_id}' references unknown token spec '{spec_id}'")]
    UnknownSpec { task_id: TaskId, spec_id: String },

    #[error("task '{task_id}' target '{target}' has no action binding")]
    MissingAction { task_id: TaskId, target: String },

    #[error("task '{task_id}' target '{target}' violates agent constraints: {reason}")]
    AgentConstraintViolated {
        task_id: TaskId,
        target: String,
        reason: String,
    },

    #[error("task '{task_id}' guard '{guard_id}' is invalid: {reason}")]
    InvalidGuard {
        task_id: TaskId,
        guard_id: String,
        reason: String,
    },

    #[error("task '{task_id}' cannot call process '{process_id}': {reason}")]
    SubprocessContract {
        task_id: TaskId,
        process_id: String,
        reason: String,
    },
}

/// Every diagnostic from one compile attempt. No compiled artifact exists
/// when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("process '{process_id}' failed to compile: {}", .errors.iter().join("; "))]
pub struct CompileFailure {
    pub process_id: String,
    pub errors: Vec<CompileError>,
}

impl CompileFailure {
    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, CompileError::CyclicGraph { .. }))
    }

    pub fn has_spec_mismatch(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, CompileError::SpecChainMismatch { .. }))
    }

    pub fn has_dangling_link(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, CompileError::DanglingLink { .. }))
    }

    pub fn cycle(&self) -> Option<&[TaskId]> {
        self.errors.iter().find_map(|e| match e {
            CompileError::CyclicGraph { cycle } => Some(cycle.as_slice()),
            _ => None,
        })
    }
}
