//! Guards, retries, failure policies, join timeouts and merge strategies.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    compiled, content, engine, engine_with, init_tracing, passthrough_actions, risk_process,
    risk_schemas, risk_token, CountingAction,
};
use tbcspn_workflow::{
    ActionContext, ActionError, ActionRegistry, AsyncFnAction, ChainAction, CheckKind, Content,
    Engine, EngineConfig, Error, FailingAction, FailurePolicy, FieldKind, FieldSpec, FnAction,
    GuardCondition,
    InMemoryProvenanceSink, JoinError, MergeStrategy, ProcessDefinition, ProvenanceSink,
    RetryPolicy, SchemaRegistry, Stage, StaticContext, TaskAction, TaskSpec, Token, TokenSpec,
    ValidationMode,
};

// =============================================================================
// Guards
// =============================================================================

fn guarded_process() -> ProcessDefinition {
    ProcessDefinition::new("guarded").with_task(
        TaskSpec::new("escalate", "risk", "risk", "escalate")
            .with_guard(GuardCondition::new("finance-relevance", "finance", 0.7)),
    )
}

fn engine_with_context(context: StaticContext) -> (Engine, Arc<InMemoryProvenanceSink>) {
    let sink = InMemoryProvenanceSink::new_arc();
    let engine = Engine::new(EngineConfig::default(), sink.clone(), Arc::new(context));
    (engine, sink)
}

#[tokio::test]
async fn given_low_relevance_when_guarded_task_fires_then_guard_rejects() {
    init_tracing();
    let escalate = CountingAction::new("escalate");
    let actions = ActionRegistry::new().with_action("escalate", escalate.clone());
    let process = compiled(&guarded_process(), &risk_schemas(), &actions);
    let (engine, sink) = engine_with_context(StaticContext::new().with_relevance("finance", 0.4));
    let token = risk_token(0.5);
    let trace = token.trace_id();

    let error = engine.run(process, token).await.unwrap_err();

    assert_eq!(error.guard_id(), Some("finance-relevance"));
    assert!(matches!(
        error,
        Error::GuardRejection { score, threshold, .. } if score == 0.4 && threshold == 0.7
    ));
    assert_eq!(escalate.calls(), 0);
    let guard_entries: Vec<_> = sink
        .entries_for_trace(trace)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.guard_id() == Some("finance-relevance"))
        .collect();
    assert_eq!(guard_entries.len(), 1);
    assert!(guard_entries[0].is_rejected());
}

#[tokio::test]
async fn given_relevance_at_threshold_when_guarded_task_fires_then_admitted() {
    let actions = passthrough_actions(&["escalate"]);
    let process = compiled(&guarded_process(), &risk_schemas(), &actions);
    let (engine, _sink) = engine_with_context(StaticContext::new().with_relevance("finance", 0.7));

    let outcome = engine.run(process, risk_token(0.5)).await.unwrap();

    let terminal = outcome.terminal_token().unwrap();
    assert!(terminal
        .history()
        .any(|e| e.guard_id() == Some("finance-relevance") && !e.is_rejected()));
}

#[tokio::test]
async fn given_no_context_score_when_token_carries_topic_weight_then_weight_is_used() {
    let actions = passthrough_actions(&["escalate"]);
    let process = compiled(&guarded_process(), &risk_schemas(), &actions);
    let (engine, _sink) = engine_with_context(StaticContext::new());
    let token = risk_token(0.5).with_topic_weight("finance", 0.9);

    let outcome = engine.run(process, token).await.unwrap();

    assert_eq!(outcome.fired("escalate"), 1);
}

// =============================================================================
// Retries and timeouts
// =============================================================================

fn flaky(failures: u32, retryable: bool) -> (Arc<AtomicU32>, Arc<dyn TaskAction>) {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let run = move |input: Content, _config: Content, ctx: ActionContext| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt <= failures {
                let error = if retryable {
                    ActionError::transient("rate limited")
                } else {
                    ActionError::permanent("bad request")
                };
                return Err(error);
            }
            Ok(input)
        }
    };
    (attempts, Arc::new(AsyncFnAction::new("flaky", run)))
}

fn retrying_process(retry: RetryPolicy) -> ProcessDefinition {
    ProcessDefinition::new("retrying")
        .with_task(TaskSpec::new("call", "risk", "risk", "flaky").with_retry(retry))
}

#[tokio::test]
async fn given_transient_failures_within_budget_when_run_then_action_succeeds() {
    let (attempts, action) = flaky(2, true);
    let actions = ActionRegistry::new().with_action("flaky", action);
    let process = compiled(
        &retrying_process(RetryPolicy::new(3).with_backoff(1, 5)),
        &risk_schemas(),
        &actions,
    );
    let (engine, _sink) = engine();

    let outcome = engine.run(process, risk_token(0.5)).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.firings[0].attempts, 3);
}

#[tokio::test]
async fn given_transient_failures_beyond_budget_when_run_then_agent_execution_error() {
    let (attempts, action) = flaky(5, true);
    let actions = ActionRegistry::new().with_action("flaky", action);
    let process = compiled(
        &retrying_process(RetryPolicy::new(2).with_backoff(1, 5)),
        &risk_schemas(),
        &actions,
    );
    let (engine, _sink) = engine();

    let error = engine.run(process, risk_token(0.5)).await.unwrap_err();

    assert!(matches!(error, Error::AgentExecution { attempts: 2, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn given_permanent_failure_when_run_then_no_retry() {
    let (attempts, action) = flaky(1, false);
    let actions = ActionRegistry::new().with_action("flaky", action);
    let process = compiled(
        &retrying_process(RetryPolicy::new(5).with_backoff(1, 5)),
        &risk_schemas(),
        &actions,
    );
    let (engine, _sink) = engine();

    let error = engine.run(process, risk_token(0.5)).await.unwrap_err();

    assert!(matches!(error, Error::AgentExecution { attempts: 1, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn given_panicking_action_when_run_then_rejection_is_recorded_after_retries() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let crash = FnAction::new(
        "crash",
        move |_input: &Content, _config: &Content| -> Result<Content, ActionError> {
            seen.fetch_add(1, Ordering::SeqCst);
            panic!("agent crashed")
        },
    );
    let actions = ActionRegistry::new().with_action("flaky", Arc::new(crash));
    let process = compiled(
        &retrying_process(RetryPolicy::new(2).with_backoff(1, 5)),
        &risk_schemas(),
        &actions,
    );
    let (engine, sink) = engine();
    let token = risk_token(0.5);
    let trace = token.trace_id();

    let error = engine.run(process, token).await.unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    match &error {
        Error::AgentExecution { attempts, message, .. } => {
            assert_eq!(*attempts, 2);
            assert!(message.contains("agent crashed"), "{message}");
        }
        other => panic!("expected agent execution error, got {other}"),
    }
    let last = sink.entries_for_task(trace, "call").await.unwrap().pop().unwrap();
    assert!(last.is_rejected());
    assert!(matches!(last.check, CheckKind::Firing));
}

#[tokio::test]
async fn given_slow_action_when_timeout_configured_then_action_timeout() {
    let slow = CountingAction::with_delay("slow", Duration::from_millis(200));
    let actions = ActionRegistry::new().with_action("slow", slow);
    let definition =
        ProcessDefinition::new("slow").with_task(TaskSpec::new("wait", "risk", "risk", "slow"));
    let process = compiled(&definition, &risk_schemas(), &actions);
    let (engine, _sink) =
        engine_with(EngineConfig::default().with_action_timeout(Duration::from_millis(20)));

    let error = engine.run(process, risk_token(0.5)).await.unwrap_err();

    assert!(matches!(error, Error::ActionTimeout { timeout_ms: 20, .. }));
    assert!(error.is_retryable());
}

// =============================================================================
// Composite actions
// =============================================================================

fn set_field(key: &'static str, value: serde_json::Value) -> Arc<dyn TaskAction> {
    Arc::new(FnAction::new(key, move |input: &Content, _config: &Content| {
        let mut out = input.clone();
        out.insert(key.to_string(), value.clone());
        Ok(out)
    }))
}

#[tokio::test]
async fn given_chained_action_when_task_fires_then_steps_apply_in_order() {
    let chain = ChainAction::new("enrich")
        .then(set_field("risk_score", serde_json::json!(0.5)))
        .then(set_field("text", serde_json::json!("escalated")))
        .then(set_field("risk_score", serde_json::json!(0.75)));
    let actions = ActionRegistry::new().with_action("escalate", Arc::new(chain));
    let process = compiled(&risk_process("chained", &["escalate"], &[]), &risk_schemas(), &actions);
    let (engine, _sink) = engine();

    let outcome = engine.run(process, risk_token(0.1)).await.unwrap();

    let terminal = outcome.terminal_token().unwrap();
    assert_eq!(terminal.content().get("risk_score"), Some(&serde_json::json!(0.75)));
    assert_eq!(terminal.content().get("text"), Some(&serde_json::json!("escalated")));
    assert_eq!(outcome.fired("escalate"), 1);
}

#[tokio::test]
async fn given_chain_step_fails_transiently_when_retried_then_whole_chain_reruns() {
    let first = CountingAction::new("first");
    let (attempts, second) = flaky(1, true);
    let chain = ChainAction::new("chain").then(first.clone()).then(second);
    let actions = ActionRegistry::new().with_action("flaky", Arc::new(chain));
    let process = compiled(
        &retrying_process(RetryPolicy::new(3).with_backoff(1, 5)),
        &risk_schemas(),
        &actions,
    );
    let (engine, _sink) = engine();

    let outcome = engine.run(process, risk_token(0.5)).await.unwrap();

    assert_eq!(outcome.firings[0].attempts, 2);
    assert_eq!(first.calls(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Failure policies
// =============================================================================

/// root -> ok_branch, root -> bad_branch. The bad branch always fails.
fn split_process() -> (ProcessDefinition, ActionRegistry, Arc<CountingAction>) {
    let ok_branch = CountingAction::with_delay("ok_branch", Duration::from_millis(20));
    let actions = passthrough_actions(&["root"])
        .with_action("ok_branch", ok_branch.clone())
        .with_action(
            "bad_branch",
            Arc::new(FailingAction::new("bad_branch", ActionError::permanent("tool crashed"))),
        );
    let definition = risk_process(
        "split",
        &["root", "ok_branch", "bad_branch"],
        &[("root", "ok_branch"), ("root", "bad_branch")],
    );
    (definition, actions, ok_branch)
}

#[tokio::test]
async fn given_continue_branches_when_one_branch_fails_then_sibling_completes() {
    let (definition, actions, ok_branch) = split_process();
    let process = compiled(&definition, &risk_schemas(), &actions);
    let (engine, _sink) = engine_with(
        EngineConfig::default().with_failure_policy(FailurePolicy::ContinueBranches),
    );

    let outcome = engine.run(process, risk_token(0.5)).await.unwrap();

    assert_eq!(ok_branch.calls(), 1);
    assert_eq!(outcome.terminal_tokens.len(), 1);
    assert_eq!(outcome.rejections.len(), 1);
    assert_eq!(outcome.rejections[0].task_id(), "bad_branch");
    assert!(!outcome.is_clean());
}

#[tokio::test]
async fn given_abort_run_when_one_branch_fails_then_run_returns_error() {
    let (definition, actions, _ok_branch) = split_process();
    let process = compiled(&definition, &risk_schemas(), &actions);
    let (engine, _sink) = engine();

    let error = engine.run(process, risk_token(0.5)).await.unwrap_err();

    assert_eq!(error.task_id(), "bad_branch");
}

#[tokio::test]
async fn given_continue_branches_when_join_input_fails_then_join_is_reported_stalled() {
    let actions = passthrough_actions(&["root", "left", "join"]).with_action(
        "right",
        Arc::new(FailingAction::new("right", ActionError::permanent("no answer"))),
    );
    let definition = risk_process(
        "stall",
        &["root", "left", "right", "join"],
        &[("root", "left"), ("root", "right"), ("left", "join"), ("right", "join")],
    );
    let process = compiled(&definition, &risk_schemas(), &actions);
    let (engine, _sink) = engine_with(
        EngineConfig::default().with_failure_policy(FailurePolicy::ContinueBranches),
    );

    let outcome = engine.run(process, risk_token(0.5)).await.unwrap();

    assert_eq!(outcome.fired("join"), 0);
    assert_eq!(outcome.stalled_joins.len(), 1);
    assert_eq!(outcome.stalled_joins[0].task_id, "join");
    assert_eq!(outcome.stalled_joins[0].missing_arcs, vec!["right".to_string()]);
}

#[tokio::test]
async fn given_join_timeout_when_arc_never_arrives_then_join_error() {
    let actions = passthrough_actions(&["root", "left", "join"]).with_action(
        "right",
        Arc::new(FailingAction::new("right", ActionError::permanent("no answer"))),
    );
    let definition = risk_process(
        "stall",
        &["root", "left", "right", "join"],
        &[("root", "left"), ("root", "right"), ("left", "join"), ("right", "join")],
    );
    let process = compiled(&definition, &risk_schemas(), &actions);
    let config = EngineConfig::default()
        .with_failure_policy(FailurePolicy::ContinueBranches)
        .with_join_timeout(Duration::from_millis(30));
    let (engine, sink) = engine_with(config);
    let token = risk_token(0.5);
    let trace = token.trace_id();

    let outcome = engine.run(process, token).await.unwrap();

    assert!(outcome.stalled_joins.is_empty());
    assert!(outcome.rejections.iter().any(|e| matches!(
        e,
        Error::Join { source: JoinError::Timeout { missing, .. }, .. }
            if missing == &vec!["right".to_string()]
    )));
    let join_entries = sink.entries_for_task(trace, "join").await.unwrap();
    assert!(join_entries
        .iter()
        .any(|e| e.is_rejected() && matches!(e.check, CheckKind::Join { .. })));
}

// =============================================================================
// Validation mode
// =============================================================================

#[tokio::test]
async fn given_aggregate_mode_when_several_fields_fail_then_all_are_reported() {
    let process = compiled(
        &risk_process("assess", &["assess"], &[]),
        &risk_schemas(),
        &passthrough_actions(&["assess"]),
    );
    let (engine, _sink) =
        engine_with(EngineConfig::default().with_validation_mode(ValidationMode::Aggregate));
    let token = Token::from_json(serde_json::json!({"risk_score": 7.0, "extra": true}));

    let error = engine.run(process, token).await.unwrap_err();

    match error {
        Error::SchemaViolation { violations, .. } => assert_eq!(violations.len(), 3),
        other => panic!("expected schema violation, got {other}"),
    }
}

#[tokio::test]
async fn given_fail_fast_mode_when_several_fields_fail_then_first_is_reported() {
    let process = compiled(
        &risk_process("assess", &["assess"], &[]),
        &risk_schemas(),
        &passthrough_actions(&["assess"]),
    );
    let (engine, _sink) = engine();
    let token = Token::from_json(serde_json::json!({"risk_score": 7.0, "extra": true}));

    let error = engine.run(process, token).await.unwrap_err();

    match error {
        Error::SchemaViolation { violations, .. } => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].field(), Some("text"));
        }
        other => panic!("expected schema violation, got {other}"),
    }
}

// =============================================================================
// Merge strategies
// =============================================================================

/// Branch outputs differ in `label`; the join task uses `strategy`.
fn labelled_join(strategy: MergeStrategy) -> (ProcessDefinition, ActionRegistry, SchemaRegistry) {
    let labelled = TokenSpec::new("labelled", "finance")
        .with_field(FieldSpec::new("text", FieldKind::String))
        .with_field(FieldSpec::new("label", FieldKind::String).optional())
        .with_field(FieldSpec::new("__inputs__", FieldKind::Json).optional())
        .with_field(FieldSpec::new("__meta__", FieldKind::String).optional());
    let schemas = SchemaRegistry::new().with_spec(labelled).unwrap();

    let label = |name: &'static str| {
        tbcspn_workflow::FnAction::new(name, move |input: &Content, _config: &Content| {
            let mut output = input.clone();
            output.insert("label".to_string(), serde_json::json!(name));
            Ok(output)
        })
    };
    let actions = ActionRegistry::new()
        .with_action("root", Arc::new(tbcspn_workflow::PassthroughAction::new("root")))
        .with_action("a", Arc::new(label("a")))
        .with_action("b", Arc::new(label("b")))
        .with_action("join", Arc::new(tbcspn_workflow::PassthroughAction::new("join")));

    let task = |id: &str| TaskSpec::new(id, "labelled", "labelled", id);
    let definition = ProcessDefinition::new("labels")
        .with_task(task("root"))
        .with_task(task("a"))
        .with_task(task("b"))
        .with_task(task("join").with_merge_strategy(strategy))
        .with_link("root", "a")
        .with_link("root", "b")
        .with_link("a", "join")
        .with_link("b", "join");
    (definition, actions, schemas)
}

fn labelled_token() -> Token {
    Token::new(content(serde_json::json!({"text": "memo"})))
}

#[tokio::test]
async fn given_strict_merge_when_branches_disagree_then_merge_conflict() {
    let (definition, actions, schemas) = labelled_join(MergeStrategy::Strict);
    let process = compiled(&definition, &schemas, &actions);
    let (engine, _sink) = engine();

    let error = engine.run(process, labelled_token()).await.unwrap_err();

    assert!(matches!(
        error,
        Error::MergeConflict { ref task_id, ref field, .. } if task_id == "join" && field == "label"
    ));
}

#[tokio::test]
async fn given_union_merge_when_branches_disagree_then_last_arc_wins() {
    let (definition, actions, schemas) = labelled_join(MergeStrategy::Union);
    let process = compiled(&definition, &schemas, &actions);
    let (engine, _sink) = engine();

    let outcome = engine.run(process, labelled_token()).await.unwrap();

    let terminal = outcome.terminal_token().unwrap();
    assert_eq!(terminal.get("label"), Some(&serde_json::json!("b")));
}

#[tokio::test]
async fn given_bundle_merge_when_joined_then_every_input_is_kept() {
    let (definition, actions, schemas) = labelled_join(MergeStrategy::Bundle);
    let process = compiled(&definition, &schemas, &actions);
    let (engine, _sink) = engine();

    let error = engine.run(process, labelled_token()).await.unwrap_err();

    // Every branch input passed; the bundle itself lacks the required `text`.
    assert!(matches!(
        error,
        Error::SchemaViolation { stage: Stage::Output, ref task_id, .. } if task_id == "join"
    ));
}
