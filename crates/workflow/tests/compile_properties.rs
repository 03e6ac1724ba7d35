//! Property and diagnostic tests for the process compiler.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::Arc;

use common::{passthrough_actions, risk_process, risk_schemas, risk_spec};
use proptest::prelude::*;
use tbcspn_workflow::{
    compile, compile_with, ActionRegistry, AgentNature, AgentProfile, AgentRole, CompileError,
    CompileOptions, FieldKind, FieldSpec, GuardCondition, PassthroughAction, ProcessDefinition,
    SchemaRegistry, TaskSpec, TokenSpec,
};

fn task_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("t{i}")).collect()
}

/// Random DAG: edges only go from a lower to a higher index.
fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..9).prop_flat_map(|n| {
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();
        let len = pairs.len();
        (Just(n), proptest::collection::vec(any::<bool>(), len)).prop_map(move |(n, mask)| {
            let edges = pairs
                .iter()
                .zip(mask)
                .filter_map(|(pair, keep)| keep.then_some(*pair))
                .collect();
            (n, edges)
        })
    })
}

fn definition(n: usize, edges: &[(usize, usize)]) -> (ProcessDefinition, ActionRegistry) {
    let ids = task_ids(n);
    let names: Vec<&str> = ids.iter().map(String::as_str).collect();
    let links: Vec<(&str, &str)> = edges
        .iter()
        .map(|(a, b)| (names[*a], names[*b]))
        .collect();
    (risk_process("random", &names, &links), passthrough_actions(&names))
}

proptest! {
    #[test]
    fn every_acyclic_graph_compiles((n, edges) in dag()) {
        let (def, actions) = definition(n, &edges);

        let compiled = compile(&def, &risk_schemas(), &actions);

        prop_assert!(compiled.is_ok(), "{:?}", compiled.err());
        let compiled = compiled.unwrap();
        prop_assert_eq!(compiled.task_count(), n);
        prop_assert!(!compiled.entry_tasks().is_empty());
        prop_assert!(!compiled.terminal_tasks().is_empty());

        // Every link goes forward in the topological order.
        let order = compiled.topological_order();
        let position = |id: &str| order.iter().position(|t| t == id).unwrap();
        for link in &def.links {
            prop_assert!(position(&link.from) < position(&link.to));
        }
    }

    #[test]
    fn any_back_edge_is_rejected_as_cyclic(
        (n, edges) in dag().prop_filter("needs an edge", |(_, e)| !e.is_empty()),
        pick in any::<prop::sample::Index>(),
    ) {
        let (from, to) = edges[pick.index(edges.len())];
        let mut with_back_edge = edges.clone();
        with_back_edge.push((to, from));
        let (def, actions) = definition(n, &with_back_edge);

        let failure = compile(&def, &risk_schemas(), &actions).unwrap_err();

        prop_assert!(failure.has_cycle());
    }

    #[test]
    fn mismatched_link_is_rejected_regardless_of_cycles(cyclic in any::<bool>()) {
        let schemas = risk_schemas()
            .with_spec(TokenSpec::new("summary", "finance")
                .with_field(FieldSpec::new("summary", FieldKind::String)))
            .unwrap();
        let mut def = ProcessDefinition::new("mismatch")
            .with_task(TaskSpec::new("a", "risk", "summary", "a"))
            .with_task(TaskSpec::new("b", "risk", "risk", "b"))
            .with_link("a", "b");
        if cyclic {
            def.add_link("b", "a");
        }

        let failure = compile(&def, &schemas, &passthrough_actions(&["a", "b"])).unwrap_err();

        prop_assert!(failure.has_spec_mismatch());
        prop_assert_eq!(failure.has_cycle(), cyclic);
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

#[test]
fn given_link_to_unknown_task_when_compile_then_dangling_link() {
    let def = risk_process("p", &["a"], &[("a", "ghost")]);

    let failure = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap_err();

    assert!(failure.has_dangling_link());
    assert!(failure.errors.contains(&CompileError::DanglingLink {
        from: "a".to_string(),
        to: "ghost".to_string(),
        missing: "ghost".to_string(),
    }));
}

#[test]
fn given_unbound_target_when_compile_then_missing_action() {
    let def = risk_process("p", &["a", "b"], &[("a", "b")]);

    let failure = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap_err();

    assert_eq!(
        failure.errors,
        vec![CompileError::MissingAction {
            task_id: "b".to_string(),
            target: "b".to_string(),
        }]
    );
}

#[test]
fn given_unknown_spec_when_compile_then_reported_per_task() {
    let def = ProcessDefinition::new("p").with_task(TaskSpec::new("a", "nope", "risk", "a"));

    let failure = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap_err();

    assert!(failure.errors.iter().any(|e| matches!(
        e,
        CompileError::UnknownSpec { task_id, spec_id } if task_id == "a" && spec_id == "nope"
    )));
}

#[test]
fn given_empty_process_when_compile_then_rejected() {
    let failure = compile(
        &ProcessDefinition::new("empty"),
        &risk_schemas(),
        &ActionRegistry::new(),
    )
    .unwrap_err();
    assert_eq!(failure.errors, vec![CompileError::EmptyProcess]);
}

#[test]
fn given_several_problems_when_compile_then_all_are_reported() {
    let def = risk_process("p", &["a", "b", "a"], &[("a", "b"), ("b", "a"), ("b", "zzz")]);

    let failure = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap_err();

    assert!(failure.has_cycle());
    assert!(failure.has_dangling_link());
    assert!(failure
        .errors
        .iter()
        .any(|e| matches!(e, CompileError::DuplicateTask { .. })));
    assert!(failure
        .errors
        .iter()
        .any(|e| matches!(e, CompileError::MissingAction { .. })));
}

#[test]
fn given_required_role_when_binding_profile_differs_then_constraint_violation() {
    let def = ProcessDefinition::new("p").with_task(
        risk_task_with_role("approve", AgentRole::Supervisor).with_agent_type(AgentNature::Human),
    );
    let mut actions = ActionRegistry::new();
    actions.register_with_profile(
        "approve",
        Arc::new(PassthroughAction::new("approve")),
        AgentProfile::new(AgentRole::Worker, AgentNature::Llm),
    );

    let failure = compile(&def, &risk_schemas(), &actions).unwrap_err();

    assert!(failure
        .errors
        .iter()
        .any(|e| matches!(
            e,
            CompileError::AgentConstraintViolated { task_id, .. } if task_id == "approve"
        )));
}

#[test]
fn given_matching_profile_when_compile_then_constraints_hold() {
    let def = ProcessDefinition::new("p")
        .with_task(risk_task_with_role("approve", AgentRole::Supervisor));
    let mut actions = ActionRegistry::new();
    actions.register_with_profile(
        "approve",
        Arc::new(PassthroughAction::new("approve")),
        AgentProfile::new(AgentRole::Supervisor, AgentNature::Human),
    );

    assert!(compile(&def, &risk_schemas(), &actions).is_ok());
}

fn risk_task_with_role(id: &str, role: AgentRole) -> TaskSpec {
    TaskSpec::new(id, "risk", "risk", id).with_role(role)
}

#[test]
fn given_guard_threshold_out_of_range_when_compile_then_invalid_guard() {
    let guard = GuardCondition::new("g", "finance", 1.5);
    let def = ProcessDefinition::new("p")
        .with_task(TaskSpec::new("a", "risk", "risk", "a").with_guard(guard));

    let failure = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap_err();

    assert!(failure
        .errors
        .iter()
        .any(|e| matches!(e, CompileError::InvalidGuard { guard_id, .. } if guard_id == "g")));
}

// =============================================================================
// Spec compatibility
// =============================================================================

fn narrow_and_wide() -> SchemaRegistry {
    // `narrow` bounds sit inside `risk` bounds, so narrow output fits risk input.
    SchemaRegistry::new()
        .with_spec(risk_spec("risk"))
        .unwrap()
        .with_spec(
            TokenSpec::new("narrow", "finance")
                .with_field(FieldSpec::new("text", FieldKind::String))
                .with_field(FieldSpec::new("risk_score", FieldKind::Float).with_range(0.2, 0.8)),
        )
        .unwrap()
}

#[test]
fn given_structurally_compatible_specs_when_compile_then_link_accepted() {
    let def = ProcessDefinition::new("p")
        .with_task(TaskSpec::new("a", "risk", "narrow", "a"))
        .with_task(TaskSpec::new("b", "risk", "risk", "b"))
        .with_link("a", "b");

    assert!(compile(&def, &narrow_and_wide(), &passthrough_actions(&["a", "b"])).is_ok());
}

#[test]
fn given_structural_check_disabled_when_spec_ids_differ_then_mismatch() {
    let def = ProcessDefinition::new("p")
        .with_task(TaskSpec::new("a", "risk", "narrow", "a"))
        .with_task(TaskSpec::new("b", "risk", "risk", "b"))
        .with_link("a", "b");
    let options = CompileOptions {
        structural_compatibility: false,
    };

    let failure = compile_with(
        &def,
        &narrow_and_wide(),
        &passthrough_actions(&["a", "b"]),
        &options,
    )
    .unwrap_err();

    assert!(failure.has_spec_mismatch());
}

#[test]
fn given_wider_producer_bounds_when_compile_then_mismatch() {
    // risk output may carry 0.9, which narrow input would reject.
    let def = ProcessDefinition::new("p")
        .with_task(TaskSpec::new("a", "risk", "risk", "a"))
        .with_task(TaskSpec::new("b", "narrow", "narrow", "b"))
        .with_link("a", "b");

    let failure =
        compile(&def, &narrow_and_wide(), &passthrough_actions(&["a", "b"])).unwrap_err();

    assert!(failure.has_spec_mismatch());
}

// =============================================================================
// Inspection
// =============================================================================

#[test]
fn given_compiled_diamond_when_inspected_then_topology_is_serializable() {
    let def = risk_process(
        "diamond",
        &["A", "B", "C", "D"],
        &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
    );
    let actions = passthrough_actions(&["A", "B", "C", "D"]);
    let compiled = compile(&def, &risk_schemas(), &actions).unwrap();

    let topology = compiled.inspect();

    assert_eq!(topology.entry_tasks, vec!["A".to_string()]);
    assert_eq!(topology.terminal_tasks, vec!["D".to_string()]);
    assert_eq!(topology.tasks.first().map(|t| t.task_id.as_str()), Some("A"));
    let join = topology.places.iter().find(|p| p.task_id == "D").unwrap();
    assert!(join.is_join());
    assert_eq!(join.required_arcs, vec!["B".to_string(), "C".to_string()]);

    let json = serde_json::to_value(&topology).unwrap();
    assert_eq!(json["process_id"], "diamond");
    assert_eq!(json["links"].as_array().map(Vec::len), Some(4));
}

#[test]
fn given_compiled_process_when_schema_looked_up_twice_then_same_spec() {
    let def = risk_process("p", &["a"], &[]);
    let compiled = compile(&def, &risk_schemas(), &passthrough_actions(&["a"])).unwrap();

    let first = compiled.schemas().get("risk").unwrap();
    let second = compiled.schemas().get("risk").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*first, *second);
}
