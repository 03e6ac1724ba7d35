//! Shared fixtures for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::arithmetic_side_effects)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tbcspn_workflow::{
    compile, ActionContext, ActionError, ActionRegistry, CompiledProcess, Content, Engine,
    EngineConfig, FieldKind, FieldSpec, InMemoryProvenanceSink, PassthroughAction,
    ProcessDefinition, SchemaRegistry, StaticContext, TaskAction, TaskSpec, Token, TokenSpec,
};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once. Set `RUST_LOG` to see engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `{text: string, risk_score: float in [0, 1]}`.
pub fn risk_spec(spec_id: &str) -> TokenSpec {
    TokenSpec::new(spec_id, "finance")
        .with_field(FieldSpec::new("text", FieldKind::String))
        .with_field(FieldSpec::new("risk_score", FieldKind::Float).with_range(0.0, 1.0))
}

pub fn risk_schemas() -> SchemaRegistry {
    SchemaRegistry::new().with_spec(risk_spec("risk")).unwrap()
}

pub fn content(value: Value) -> Content {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn risk_token(score: f64) -> Token {
    Token::from_json(serde_json::json!({"text": "A", "risk_score": score}))
}

/// A task reading and writing the `risk` spec, bound to `target`.
pub fn risk_task(task_id: &str, target: &str) -> TaskSpec {
    TaskSpec::new(task_id, "risk", "risk", target)
}

/// Process over `risk` with one task per id (each bound to a target of the
/// same name) and the given links.
pub fn risk_process(process_id: &str, tasks: &[&str], links: &[(&str, &str)]) -> ProcessDefinition {
    let definition = tasks
        .iter()
        .fold(ProcessDefinition::new(process_id), |def, id| {
            def.with_task(risk_task(id, id))
        });
    links
        .iter()
        .fold(definition, |def, (from, to)| def.with_link(*from, *to))
}

/// Registry binding every name to a passthrough action.
pub fn passthrough_actions(names: &[&str]) -> ActionRegistry {
    names.iter().fold(ActionRegistry::new(), |registry, name| {
        registry.with_action(*name, Arc::new(PassthroughAction::new(*name)))
    })
}

pub fn compiled(
    definition: &ProcessDefinition,
    schemas: &SchemaRegistry,
    actions: &ActionRegistry,
) -> Arc<CompiledProcess> {
    Arc::new(compile(definition, schemas, actions).unwrap())
}

pub fn engine_with(config: EngineConfig) -> (Engine, Arc<InMemoryProvenanceSink>) {
    let sink = InMemoryProvenanceSink::new_arc();
    let engine = Engine::new(config, sink.clone(), Arc::new(StaticContext::new()));
    (engine, sink)
}

pub fn engine() -> (Engine, Arc<InMemoryProvenanceSink>) {
    engine_with(EngineConfig::default())
}

/// Passthrough action that counts its invocations and can be slowed down.
pub struct CountingAction {
    name: String,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingAction {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_delay(name, Duration::ZERO)
    }

    pub fn with_delay(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskAction for CountingAction {
    async fn invoke(
        &self,
        content: &Content,
        _config: &Content,
        _ctx: &ActionContext,
    ) -> Result<Content, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(content.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
