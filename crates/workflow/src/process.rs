//! Process declarations: tasks plus directed links, not yet runnable.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tbcspn_events::TaskId;

use crate::task::TaskSpec;

fn default_version() -> String {
    "1".to_string()
}

/// Directed link: `to` consumes what `from` emits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub from: TaskId,
    pub to: TaskId,
}

impl Link {
    pub fn new(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A process graph as authored. Links may reference unknown tasks; the
/// compiler reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl ProcessDefinition {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            version: default_version(),
            tasks: Vec::new(),
            links: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    #[must_use]
    pub fn with_link(mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        self.links.push(Link::new(from, to));
        self
    }

    pub fn add_task(&mut self, task: TaskSpec) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn add_link(&mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> &mut Self {
        self.links.push(Link::new(from, to));
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Load from a JSON, YAML or TOML document.
    pub fn from_document(path: &Path) -> tbcspn_core::Result<Self> {
        let definition: Self = tbcspn_core::load_document(path)?;
        tracing::debug!(
            process_id = %definition.process_id,
            version = %definition.version,
            tasks = definition.tasks.len(),
            links = definition.links.len(),
            "Loaded process definition"
        );
        Ok(definition)
    }
}

/// Read-only source of process definitions.
pub trait ProcessSource: Send + Sync {
    fn get_process(&self, name: &str, version: &str) -> Option<ProcessDefinition>;
}

/// Process definitions held in memory, keyed by id and version.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProcessSource {
    processes: HashMap<(String, String), ProcessDefinition>,
}

impl InMemoryProcessSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition, replacing any with the same id and version.
    pub fn insert(&mut self, definition: ProcessDefinition) {
        let key = (definition.process_id.clone(), definition.version.clone());
        self.processes.insert(key, definition);
    }

    #[must_use]
    pub fn with(mut self, definition: ProcessDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl ProcessSource for InMemoryProcessSource {
    fn get_process(&self, name: &str, version: &str) -> Option<ProcessDefinition> {
        self.processes
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }
}
