//! Task actions and the registry that binds them to task targets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tbcspn_events::{TaskId, TraceId};
use thiserror::Error;

use crate::compiler::CompiledProcess;
use crate::task::{AgentNature, AgentRole};
use crate::token::Content;

/// Opaque failure reported by an action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Whether the task's retry policy may try again.
    pub retryable: bool,
}

impl ActionError {
    /// A failure that may succeed on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure no retry can fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Facts about the firing an action runs in.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub trace_id: TraceId,
    pub task_id: TaskId,
    pub process_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Sub-process nesting depth; 0 for the top-level process.
    pub call_depth: usize,
}

/// External work bound to a task: an agent, an LLM call, a tool.
///
/// The action receives the merged, validated input content and the task's
/// configuration. Its output is validated against the task's output spec
/// before it is forwarded.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn invoke(
        &self,
        content: &Content,
        config: &Content,
        ctx: &ActionContext,
    ) -> Result<Content, ActionError>;

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Who performs an action; checked against a task's agent constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub nature: AgentNature,
}

impl AgentProfile {
    pub fn new(role: AgentRole, nature: AgentNature) -> Self {
        Self { role, nature }
    }
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self::new(AgentRole::Worker, AgentNature::Tool)
    }
}

/// What a task target resolves to.
#[derive(Clone)]
pub enum ActionBinding {
    Native {
        action: Arc<dyn TaskAction>,
        profile: AgentProfile,
    },
    /// Run another compiled process as this task's action.
    Subprocess {
        process: Arc<CompiledProcess>,
        profile: AgentProfile,
    },
}

impl ActionBinding {
    pub fn profile(&self) -> AgentProfile {
        match self {
            Self::Native { profile, .. } | Self::Subprocess { profile, .. } => *profile,
        }
    }

    pub fn is_subprocess(&self) -> bool {
        matches!(self, Self::Subprocess { .. })
    }
}

impl std::fmt::Debug for ActionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native { action, profile } => f
                .debug_struct("Native")
                .field("action", &action.name())
                .field("profile", profile)
                .finish(),
            Self::Subprocess { process, profile } => f
                .debug_struct("Subprocess")
                .field("process", &process.process_id())
                .field("profile", profile)
                .finish(),
        }
    }
}

/// Capability registry keyed by task target.
#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    bindings: HashMap<String, ActionBinding>,
}

impl ActionRegistry {
    /// Registry with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a native action with the default profile.
    pub fn register(&mut self, target: impl Into<String>, action: Arc<dyn TaskAction>) {
        self.register_with_profile(target, action, AgentProfile::default());
    }

    /// Bind a native action with an explicit agent profile.
    pub fn register_with_profile(
        &mut self,
        target: impl Into<String>,
        action: Arc<dyn TaskAction>,
        profile: AgentProfile,
    ) {
        self.bindings
            .insert(target.into(), ActionBinding::Native { action, profile });
    }

    /// Bind a compiled process as a sub-process call.
    pub fn register_subprocess(
        &mut self,
        target: impl Into<String>,
        process: Arc<CompiledProcess>,
    ) {
        self.bindings.insert(
            target.into(),
            ActionBinding::Subprocess {
                process,
                profile: AgentProfile::new(AgentRole::Supervisor, AgentNature::Tool),
            },
        );
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_action(mut self, target: impl Into<String>, action: Arc<dyn TaskAction>) -> Self {
        self.register(target, action);
        self
    }

    /// Builder form of [`register_subprocess`](Self::register_subprocess).
    #[must_use]
    pub fn with_subprocess(
        mut self,
        target: impl Into<String>,
        process: Arc<CompiledProcess>,
    ) -> Self {
        self.register_subprocess(target, process);
        self
    }

    /// Binding for a task target, if any.
    pub fn get(&self, target: &str) -> Option<&ActionBinding> {
        self.bindings.get(target)
    }

    /// True when the target is bound.
    pub fn has(&self, target: &str) -> bool {
        self.bindings.contains_key(target)
    }

    /// Bound targets, in no particular order.
    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(|s| s.as_str()).collect()
    }

    /// Number of bound targets.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Returns its input unchanged.
pub struct PassthroughAction {
    name: String,
}

impl PassthroughAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl TaskAction for PassthroughAction {
    async fn invoke(
        &self,
        content: &Content,
        _config: &Content,
        _ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        Ok(content.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Always fails (for testing).
pub struct FailingAction {
    name: String,
    error: ActionError,
}

impl FailingAction {
    pub fn new(name: impl Into<String>, error: ActionError) -> Self {
        Self {
            name: name.into(),
            error,
        }
    }
}

#[async_trait]
impl TaskAction for FailingAction {
    async fn invoke(
        &self,
        _content: &Content,
        _config: &Content,
        _ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        Err(self.error.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An action that runs a closure.
pub struct FnAction<F>
where
    F: Fn(&Content, &Content) -> Result<Content, ActionError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Content, &Content) -> Result<Content, ActionError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> TaskAction for FnAction<F>
where
    F: Fn(&Content, &Content) -> Result<Content, ActionError> + Send + Sync,
{
    async fn invoke(
        &self,
        content: &Content,
        config: &Content,
        _ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        (self.func)(content, config)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An action that delegates to an async function.
pub struct AsyncFnAction<F, Fut>
where
    F: Fn(Content, Content, ActionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Content, ActionError>> + Send,
{
    name: String,
    func: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnAction<F, Fut>
where
    F: Fn(Content, Content, ActionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Content, ActionError>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskAction for AsyncFnAction<F, Fut>
where
    F: Fn(Content, Content, ActionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Content, ActionError>> + Send,
{
    async fn invoke(
        &self,
        content: &Content,
        config: &Content,
        ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        (self.func)(content.clone(), config.clone(), ctx.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Runs actions in sequence, feeding each output into the next.
pub struct ChainAction {
    name: String,
    actions: Vec<Arc<dyn TaskAction>>,
}

impl ChainAction {
    /// Empty chain; with no steps it returns its input.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    /// Append a step fed with the previous step's output.
    #[must_use]
    pub fn then(mut self, action: Arc<dyn TaskAction>) -> Self {
        self.actions.push(action);
        self
    }
}

#[async_trait]
impl TaskAction for ChainAction {
    async fn invoke(
        &self,
        content: &Content,
        config: &Content,
        ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        let mut current = content.clone();
        for action in &self.actions {
            current = action.invoke(&current, config, ctx).await?;
        }
        Ok(current)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
