//! Deterministic workflow engine for LLM agent tasks.
//!
//! Work flows through a process as typed [`Token`]s. A process is a graph of
//! tasks; each task consumes tokens matching an input spec and emits tokens
//! matching an output spec. Key features:
//!
//! - **Schema checks**: every token is validated against the declared
//!   [`TokenSpec`] on the way into and out of a task.
//! - **Compile-time verification**: [`compile`] rejects dangling links,
//!   cycles, incompatible producer/consumer specs and unresolved actions
//!   before anything runs.
//! - **AND-joins**: a task with several incoming links fires once per
//!   complete set of arrivals.
//! - **Relevance guards**: a task only admits tokens whose topic relevance
//!   reaches its threshold.
//! - **Nested processes**: a task may run another compiled process on an
//!   explicit, depth-bounded call stack.
//! - **Provenance**: every check lands in a [`ProvenanceSink`] before its
//!   outcome takes effect.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tbcspn_workflow::{
//!     compile, ActionRegistry, Engine, EngineConfig, FieldKind, FieldSpec,
//!     InMemoryProvenanceSink, PassthroughAction, ProcessDefinition, SchemaRegistry,
//!     StaticContext, TaskSpec, Token, TokenSpec,
//! };
//!
//! let schemas = SchemaRegistry::new().with_spec(
//!     TokenSpec::new("risk", "finance")
//!         .with_field(FieldSpec::new("score", FieldKind::Float).with_range(0.0, 1.0)),
//! )?;
//! let actions =
//!     ActionRegistry::new().with_action("score", Arc::new(PassthroughAction::new("score")));
//! let process = ProcessDefinition::new("triage")
//!     .with_task(TaskSpec::new("assess", "risk", "risk", "score"));
//! let compiled = Arc::new(compile(&process, &schemas, &actions)?);
//!
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     InMemoryProvenanceSink::new_arc(),
//!     Arc::new(StaticContext::new()),
//! );
//! let outcome = engine.run(compiled, Token::from_json(serde_json::json!({"score": 0.96}))).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod handler;
pub mod place;
pub mod process;
pub mod schema;
pub mod task;
pub mod token;

pub use compiler::{
    compile, compile_with, CompileError, CompileFailure, CompiledProcess, CompiledTask,
    PlaceSpec, ProcessTopology, TaskTopology,
};
pub use config::{
    CompileOptions, ConfigError, EngineConfig, FailurePolicy, RetryPolicy, ValidationMode,
};
pub use engine::{CallStack, Engine, FiringRecord, Frame, RunOutcome, StalledJoin};
pub use error::{Error, Result};
pub use guard::{ContextProvider, GuardCondition, GuardVerdict, StaticContext};
pub use handler::{
    ActionBinding, ActionContext, ActionError, ActionRegistry, AgentProfile, AsyncFnAction,
    ChainAction, FailingAction, FnAction, PassthroughAction, TaskAction,
};
pub use place::{JoinError, JoinPolicy, JoinedSet, Place, SharedPlace, ENTRY_ARC};
pub use process::{InMemoryProcessSource, Link, ProcessDefinition, ProcessSource};
pub use schema::{
    check_compatibility, Compatibility, FieldKind, FieldSpec, SchemaError, SchemaRegistry,
    SchemaSource, TokenSpec, ValidationError, Validator,
};
pub use task::{AgentNature, AgentRole, Layer, MergeStrategy, TaskSpec, TaskState};
pub use token::{Content, Token};

pub use tbcspn_events::{
    CheckKind, InMemoryProvenanceSink, Outcome, ProvenanceEntry, ProvenanceSink, Stage,
    TaskId, TokenId, TraceId, TracingProvenanceSink,
};
