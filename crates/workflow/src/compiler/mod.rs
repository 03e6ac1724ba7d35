//! Process compiler and verifier.
//!
//! Turns a [`ProcessDefinition`] into an immutable [`CompiledProcess`]. A
//! process compiles only if
//! - every link references declared tasks,
//! - the task graph is acyclic,
//! - every link's producer output spec is accepted by the consumer input spec,
//! - every task target resolves to an action binding that satisfies the
//!   task's agent constraints.
//!
//! The compiler collects every diagnostic it finds and reports them together
//! in a [`CompileFailure`].

mod error;
pub mod graph;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tbcspn_events::TaskId;
use tracing::{error, info};

pub use error::{CompileError, CompileFailure};
pub use graph::ProcessGraph;

use crate::config::CompileOptions;
use crate::handler::{ActionBinding, ActionRegistry};
use crate::place::ENTRY_ARC;
use crate::process::{Link, ProcessDefinition};
use crate::schema::{check_compatibility, SchemaRegistry, TokenSpec};
use crate::task::{Layer, MergeStrategy, TaskSpec};

/// A task with its binding and specs resolved.
#[derive(Debug, Clone)]
pub struct CompiledTask {
    spec: TaskSpec,
    binding: ActionBinding,
    input: Arc<TokenSpec>,
    output: Arc<TokenSpec>,
}

impl CompiledTask {
    pub const fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn task_id(&self) -> &str {
        &self.spec.task_id
    }

    pub const fn binding(&self) -> &ActionBinding {
        &self.binding
    }

    pub const fn input_spec(&self) -> &Arc<TokenSpec> {
        &self.input
    }

    pub const fn output_spec(&self) -> &Arc<TokenSpec> {
        &self.output
    }
}

/// Input place of a task: the arcs that must all deliver before it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceSpec {
    pub task_id: TaskId,
    pub required_arcs: Vec<String>,
}

impl PlaceSpec {
    pub fn is_join(&self) -> bool {
        self.required_arcs.len() > 1
    }
}

/// A verified, runnable process. Immutable; share it behind an `Arc`.
#[derive(Debug)]
pub struct CompiledProcess {
    process_id: String,
    version: String,
    tasks: BTreeMap<TaskId, CompiledTask>,
    places: BTreeMap<TaskId, PlaceSpec>,
    successors: BTreeMap<TaskId, Vec<TaskId>>,
    links: Vec<Link>,
    entry_tasks: Vec<TaskId>,
    terminal_tasks: Vec<TaskId>,
    topological_order: Vec<TaskId>,
    schemas: SchemaRegistry,
}

impl CompiledProcess {
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn task(&self, task_id: &str) -> Option<&CompiledTask> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &CompiledTask> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn place(&self, task_id: &str) -> Option<&PlaceSpec> {
        self.places.get(task_id)
    }

    pub fn places(&self) -> impl Iterator<Item = &PlaceSpec> {
        self.places.values()
    }

    pub fn successors(&self, task_id: &str) -> &[TaskId] {
        self.successors.get(task_id).map_or(&[], Vec::as_slice)
    }

    /// Tasks with no predecessors; they receive the run's entry token.
    pub fn entry_tasks(&self) -> &[TaskId] {
        &self.entry_tasks
    }

    /// Tasks with no successors; their outputs are the run's result.
    pub fn terminal_tasks(&self) -> &[TaskId] {
        &self.terminal_tasks
    }

    pub fn topological_order(&self) -> &[TaskId] {
        &self.topological_order
    }

    /// Snapshot of the specs this process was compiled against.
    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Task and place topology for audit and display.
    pub fn inspect(&self) -> ProcessTopology {
        ProcessTopology {
            process_id: self.process_id.clone(),
            version: self.version.clone(),
            tasks: self
                .topological_order
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .map(|task| TaskTopology {
                    task_id: task.spec.task_id.clone(),
                    layer: task.spec.layer,
                    input_spec_id: task.spec.input_spec_id.clone(),
                    output_spec_id: task.spec.output_spec_id.clone(),
                    target: task.spec.target.clone(),
                    subprocess: match &task.binding {
                        ActionBinding::Subprocess { process, .. } => {
                            Some(process.process_id.clone())
                        }
                        ActionBinding::Native { .. } => None,
                    },
                    guards: task.spec.guards.iter().map(|g| g.guard_id.clone()).collect(),
                })
                .collect(),
            places: self.places.values().cloned().collect(),
            links: self.links.clone(),
            entry_tasks: self.entry_tasks.clone(),
            terminal_tasks: self.terminal_tasks.clone(),
            topological_order: self.topological_order.clone(),
        }
    }
}

/// Serializable view of a compiled process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessTopology {
    pub process_id: String,
    pub version: String,
    /// In topological order.
    pub tasks: Vec<TaskTopology>,
    pub places: Vec<PlaceSpec>,
    pub links: Vec<Link>,
    pub entry_tasks: Vec<TaskId>,
    pub terminal_tasks: Vec<TaskId>,
    pub topological_order: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTopology {
    pub task_id: TaskId,
    pub layer: Layer,
    pub input_spec_id: String,
    pub output_spec_id: String,
    pub target: String,
    /// Called process id, for sub-process tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprocess: Option<String>,
    pub guards: Vec<String>,
}

/// Compile with default options.
pub fn compile(
    definition: &ProcessDefinition,
    schemas: &SchemaRegistry,
    actions: &ActionRegistry,
) -> Result<CompiledProcess, CompileFailure> {
    compile_with(definition, schemas, actions, &CompileOptions::default())
}

/// Compile and verify a process definition.
pub fn compile_with(
    definition: &ProcessDefinition,
    schemas: &SchemaRegistry,
    actions: &ActionRegistry,
    options: &CompileOptions,
) -> Result<CompiledProcess, CompileFailure> {
    let fail = |errors: Vec<CompileError>| {
        error!(
            process_id = %definition.process_id,
            errors = errors.len(),
            "Process failed to compile"
        );
        CompileFailure {
            process_id: definition.process_id.clone(),
            errors,
        }
    };

    if definition.tasks.is_empty() {
        return Err(fail(vec![CompileError::EmptyProcess]));
    }

    let mut errors = Vec::new();
    let mut graph = ProcessGraph::new();
    let mut resolved: BTreeMap<TaskId, CompiledTask> = BTreeMap::new();

    for task in &definition.tasks {
        if !graph.add_task(&task.task_id) {
            errors.push(CompileError::DuplicateTask {
                task_id: task.task_id.clone(),
            });
            continue;
        }
        if let Some(compiled) = resolve_task(task, schemas, actions, options, &mut errors) {
            resolved.insert(task.task_id.clone(), compiled);
        }
    }

    let mut seen_links = HashSet::new();
    let mut valid_links = Vec::new();
    for link in &definition.links {
        let missing: Vec<&TaskId> = [&link.from, &link.to]
            .into_iter()
            .filter(|id| !graph.contains(id))
            .collect();
        if !missing.is_empty() {
            errors.extend(missing.into_iter().map(|id| CompileError::DanglingLink {
                from: link.from.clone(),
                to: link.to.clone(),
                missing: id.clone(),
            }));
            continue;
        }
        if !seen_links.insert(link.clone()) {
            errors.push(CompileError::DuplicateLink {
                from: link.from.clone(),
                to: link.to.clone(),
            });
            continue;
        }
        graph.add_link(&link.from, &link.to);
        valid_links.push(link.clone());
    }

    if let Some(cycle) = graph.find_cycle() {
        errors.push(CompileError::CyclicGraph { cycle });
    }

    for link in &valid_links {
        let (Some(producer), Some(consumer)) = (resolved.get(&link.from), resolved.get(&link.to))
        else {
            continue;
        };
        if let Err(reason) = check_compatibility(
            &producer.output,
            &consumer.input,
            options.structural_compatibility,
        ) {
            errors.push(CompileError::SpecChainMismatch {
                from: link.from.clone(),
                to: link.to.clone(),
                output_spec: producer.output.spec_id.clone(),
                input_spec: consumer.input.spec_id.clone(),
                reason,
            });
        }
    }

    if !errors.is_empty() {
        return Err(fail(errors));
    }

    let Some(topological_order) = graph.topological_order() else {
        return Err(fail(vec![CompileError::CyclicGraph { cycle: Vec::new() }]));
    };

    let mut places = BTreeMap::new();
    let mut successors = BTreeMap::new();
    let mut entry_tasks = Vec::new();
    let mut terminal_tasks = Vec::new();

    for task_id in &topological_order {
        let predecessors = graph.predecessors(task_id);
        let next = graph.successors(task_id);

        let required_arcs = if predecessors.is_empty() {
            entry_tasks.push(task_id.clone());
            vec![ENTRY_ARC.to_string()]
        } else {
            predecessors
        };
        if next.is_empty() {
            terminal_tasks.push(task_id.clone());
        }

        places.insert(
            task_id.clone(),
            PlaceSpec {
                task_id: task_id.clone(),
                required_arcs,
            },
        );
        successors.insert(task_id.clone(), next);
    }

    info!(
        process_id = %definition.process_id,
        version = %definition.version,
        tasks = resolved.len(),
        links = valid_links.len(),
        entries = entry_tasks.len(),
        terminals = terminal_tasks.len(),
        "Process compiled"
    );

    Ok(CompiledProcess {
        process_id: definition.process_id.clone(),
        version: definition.version.clone(),
        tasks: resolved,
        places,
        successors,
        links: valid_links,
        entry_tasks,
        terminal_tasks,
        topological_order,
        schemas: schemas.clone(),
    })
}

/// Resolve specs, guards and binding of one task, pushing any problems.
fn resolve_task(
    task: &TaskSpec,
    schemas: &SchemaRegistry,
    actions: &ActionRegistry,
    options: &CompileOptions,
    errors: &mut Vec<CompileError>,
) -> Option<CompiledTask> {
    let before = errors.len();
    let lookup = |spec_id: &str, errors: &mut Vec<CompileError>| {
        let spec = schemas.get(spec_id);
        if spec.is_none() {
            errors.push(CompileError::UnknownSpec {
                task_id: task.task_id.clone(),
                spec_id: spec_id.to_string(),
            });
        }
        spec
    };
    let input = lookup(&task.input_spec_id, errors);
    let output = lookup(&task.output_spec_id, errors);

    for guard in &task.guards {
        if let Err(reason) = guard.check() {
            errors.push(CompileError::InvalidGuard {
                task_id: task.task_id.clone(),
                guard_id: guard.guard_id.clone(),
                reason,
            });
        }
    }

    let binding = actions.get(&task.target).cloned();
    match &binding {
        None => errors.push(CompileError::MissingAction {
            task_id: task.task_id.clone(),
            target: task.target.clone(),
        }),
        Some(binding) => {
            if let Err(reason) = check_agent_constraints(task, binding) {
                errors.push(CompileError::AgentConstraintViolated {
                    task_id: task.task_id.clone(),
                    target: task.target.clone(),
                    reason,
                });
            }
        }
    }

    let (input, output, binding) = (input?, output?, binding?);

    if let ActionBinding::Subprocess { process, .. } = &binding {
        if let Err(reason) = check_subprocess_contract(task, &input, &output, process, options) {
            errors.push(CompileError::SubprocessContract {
                task_id: task.task_id.clone(),
                process_id: process.process_id.clone(),
                reason,
            });
        }
    }

    (errors.len() == before).then(|| CompiledTask {
        spec: task.clone(),
        binding,
        input,
        output,
    })
}

fn check_agent_constraints(task: &TaskSpec, binding: &ActionBinding) -> Result<(), String> {
    let profile = binding.profile();
    if !task.required_agent_roles.is_empty() && !task.required_agent_roles.contains(&profile.role) {
        return Err(format!(
            "role {:?} not in {:?}",
            profile.role, task.required_agent_roles
        ));
    }
    if !task.required_agent_types.is_empty()
        && !task.required_agent_types.contains(&profile.nature)
    {
        return Err(format!(
            "agent type {:?} not in {:?}",
            profile.nature, task.required_agent_types
        ));
    }
    Ok(())
}

/// The caller's input must feed the callee's entry, and the callee's
/// terminal output must satisfy the caller's output spec.
fn check_subprocess_contract(
    task: &TaskSpec,
    input: &TokenSpec,
    output: &TokenSpec,
    callee: &CompiledProcess,
    options: &CompileOptions,
) -> Result<(), String> {
    if task.merge_strategy == MergeStrategy::Bundle {
        return Err("bundled inputs cannot be passed to a sub-process".to_string());
    }

    let (entry, terminal) = match (callee.entry_tasks(), callee.terminal_tasks()) {
        ([entry], [terminal]) => (entry, terminal),
        (entries, terminals) => {
            return Err(format!(
                "callee must have exactly one entry and one terminal task (has {} and {})",
                entries.len(),
                terminals.len()
            ));
        }
    };

    let callee_input = callee
        .task(entry)
        .map(|t| Arc::clone(&t.input))
        .ok_or_else(|| format!("entry task '{entry}' missing"))?;
    let callee_output = callee
        .task(terminal)
        .map(|t| Arc::clone(&t.output))
        .ok_or_else(|| format!("terminal task '{terminal}' missing"))?;

    check_compatibility(input, &callee_input, options.structural_compatibility)
        .map_err(|reason| format!("call input: {reason}"))?;
    check_compatibility(&callee_output, output, options.structural_compatibility)
        .map_err(|reason| format!("call result: {reason}"))?;
    Ok(())
}
