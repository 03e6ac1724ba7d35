//! Tokens: schema-checked data units flowing through a process.
//!
//! A token is never changed once it sits in a place. Firing a task consumes
//! its input tokens and produces a new token with the same trace id, a
//! parent link to each input and an extended provenance history.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use im::Vector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tbcspn_events::{ProvenanceEntry, TaskId, TokenId, TraceId};

/// Content mapping carried by a token.
pub type Content = serde_json::Map<String, Value>;

/// A schema-checked data container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    token_id: TokenId,
    trace_id: TraceId,
    content: Content,
    topic: Option<String>,
    /// Topic relevance weights in `[0.0, 1.0]`.
    topics: BTreeMap<String, f64>,
    /// Lineage back-references; the parents are not kept alive.
    parents: Vec<TokenId>,
    source_task: Option<TaskId>,
    history: Vector<ProvenanceEntry>,
    created_at: DateTime<Utc>,
}

impl Token {
    /// Entry token for a new run, with a fresh trace id.
    pub fn new(content: Content) -> Self {
        Self::with_trace(TraceId::new(), content)
    }

    /// Entry token bound to an existing trace id.
    pub fn with_trace(trace_id: TraceId, content: Content) -> Self {
        Self {
            token_id: TokenId::new(),
            trace_id,
            content,
            topic: None,
            topics: BTreeMap::new(),
            parents: Vec::new(),
            source_task: None,
            history: Vector::new(),
            created_at: Utc::now(),
        }
    }

    /// Entry token from a JSON object. Non-object values yield empty content.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::new(map),
            _ => Self::new(Content::new()),
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set a topic weight, clamped to `[0.0, 1.0]`.
    #[must_use]
    pub fn with_topic_weight(mut self, topic: impl Into<String>, weight: f64) -> Self {
        self.topics.insert(topic.into(), weight.clamp(0.0, 1.0));
        self
    }

    pub const fn token_id(&self) -> TokenId {
        self.token_id
    }

    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub const fn content(&self) -> &Content {
        &self.content
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.content.get(field)
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub const fn topics(&self) -> &BTreeMap<String, f64> {
        &self.topics
    }

    pub fn topic_weight(&self, topic: &str) -> Option<f64> {
        self.topics.get(topic).copied()
    }

    pub fn parents(&self) -> &[TokenId] {
        &self.parents
    }

    /// Task that emitted this token; `None` for entry tokens.
    pub fn source_task(&self) -> Option<&str> {
        self.source_task.as_deref()
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Provenance of this token's lineage, ordered by run sequence number.
    pub fn history(&self) -> impl Iterator<Item = &ProvenanceEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn into_content(self) -> Content {
        self.content
    }

    /// Append a provenance entry. Consumes the token so an entry can only be
    /// added by whoever currently owns it.
    #[must_use]
    pub(crate) fn with_entry(mut self, entry: ProvenanceEntry) -> Self {
        self.history.push_back(entry);
        self
    }

    /// New output token emitted by `task_id` from this token.
    pub(crate) fn derive(&self, content: Content, task_id: &str) -> Self {
        Self {
            token_id: TokenId::new(),
            trace_id: self.trace_id,
            content,
            topic: self.topic.clone(),
            topics: self.topics.clone(),
            parents: vec![self.token_id],
            source_task: Some(task_id.to_string()),
            history: self.history.clone(),
            created_at: Utc::now(),
        }
    }

    /// Distinct copy for a second destination place.
    pub(crate) fn fork(&self) -> Self {
        Self {
            token_id: TokenId::new(),
            parents: vec![self.token_id],
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Combine several tokens of one trace into a single token.
    ///
    /// Histories are merged without duplicates and re-ordered by sequence
    /// number. Topic weights keep the highest weight seen per topic.
    pub(crate) fn merge(trace_id: TraceId, tokens: &[Token], content: Content) -> Self {
        let mut seen = HashSet::new();
        let mut entries: Vec<ProvenanceEntry> = tokens
            .iter()
            .flat_map(|t| t.history.iter())
            .filter(|e| seen.insert(e.entry_id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);

        let mut topics = BTreeMap::new();
        for (topic, weight) in tokens.iter().flat_map(|t| t.topics.iter()) {
            let slot = topics.entry(topic.clone()).or_insert(*weight);
            *slot = slot.max(*weight);
        }

        Self {
            token_id: TokenId::new(),
            trace_id,
            content,
            topic: tokens.iter().find_map(|t| t.topic.clone()),
            topics,
            parents: tokens.iter().map(|t| t.token_id).collect(),
            source_task: None,
            history: entries.into_iter().collect(),
            created_at: Utc::now(),
        }
    }

    /// Mark the task that emitted this token.
    #[must_use]
    pub(crate) fn emitted_by(mut self, task_id: &str) -> Self {
        self.source_task = Some(task_id.to_string());
        self
    }
}
