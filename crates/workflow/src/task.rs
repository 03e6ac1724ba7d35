//! Task (transition) declarations and the per-firing state machine.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tbcspn_events::TaskId;

use crate::config::RetryPolicy;
use crate::guard::GuardCondition;
use crate::token::Content;

/// Communication layer a task belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Interaction entry and exit.
    Surface,
    /// Semantic interpretation and topic refinement.
    Observation,
    #[default]
    Computation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Consultant,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentNature {
    Human,
    Llm,
    Tool,
}

/// How the tokens of a released AND-join become one input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Union of fields; differing values for one field are a conflict.
    #[default]
    Strict,
    /// Union of fields; later arcs overwrite earlier ones.
    Union,
    /// Keep each input whole under `__inputs__`.
    Bundle,
}

/// Declaration of one processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub layer: Layer,
    /// Empty means any role.
    #[serde(default)]
    pub required_agent_roles: BTreeSet<AgentRole>,
    /// Empty means any agent type.
    #[serde(default)]
    pub required_agent_types: BTreeSet<AgentNature>,
    #[serde(default)]
    pub guards: Vec<GuardCondition>,
    pub input_spec_id: String,
    pub output_spec_id: String,
    /// Action binding key, resolved at compile time.
    pub target: String,
    #[serde(default)]
    pub config: Content,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new(
        task_id: impl Into<TaskId>,
        input_spec_id: impl Into<String>,
        output_spec_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            description: String::new(),
            layer: Layer::default(),
            required_agent_roles: BTreeSet::new(),
            required_agent_types: BTreeSet::new(),
            guards: Vec::new(),
            input_spec_id: input_spec_id.into(),
            output_spec_id: output_spec_id.into(),
            target: target.into(),
            config: Content::new(),
            merge_strategy: MergeStrategy::default(),
            retry: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.required_agent_roles.insert(role);
        self
    }

    #[must_use]
    pub fn with_agent_type(mut self, nature: AgentNature) -> Self {
        self.required_agent_types.insert(nature);
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: GuardCondition) -> Self {
        self.guards.push(guard);
        self
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Progress of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Validating,
    Guarding,
    Executing,
    Emitting,
    Fired,
    Rejected,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fired | Self::Rejected)
    }

    /// Forward one step, or reject from any non-terminal state.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::{Emitting, Executing, Fired, Guarding, Pending, Rejected, Validating};

        match (self, next) {
            (Pending, Validating)
            | (Validating, Guarding)
            | (Guarding, Executing)
            | (Executing, Emitting)
            | (Emitting, Fired) => true,
            (current, Rejected) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Guarding => "guarding",
            Self::Executing => "executing",
            Self::Emitting => "emitting",
            Self::Fired => "fired",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}
