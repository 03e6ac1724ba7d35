//! Provenance sink trait and implementations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::provenance::ProvenanceEntry;
use crate::types::{EntryId, TraceId};

/// Append-only destination for provenance entries.
///
/// Entries for one trace may arrive out of `seq` order when firings run
/// concurrently. Readers get them back ordered by `seq`.
#[async_trait]
pub trait ProvenanceSink: Send + Sync {
    /// Append an entry.
    async fn record(&self, entry: ProvenanceEntry) -> Result<()>;

    /// All entries of one trace, ordered by `seq`.
    async fn entries_for_trace(&self, trace_id: TraceId) -> Result<Vec<ProvenanceEntry>>;

    /// Entries of one trace produced at a given task, ordered by `seq`.
    async fn entries_for_task(
        &self,
        trace_id: TraceId,
        task_id: &str,
    ) -> Result<Vec<ProvenanceEntry>> {
        let entries = self.entries_for_trace(trace_id).await?;
        Ok(entries.into_iter().filter(|e| e.task_id == task_id).collect())
    }

    /// Total number of entries recorded.
    async fn count(&self) -> Result<usize>;
}

/// In-memory sink, used by tests and embedders without external storage.
#[derive(Default)]
pub struct InMemoryProvenanceSink {
    entries: RwLock<Vec<ProvenanceEntry>>,
    trace_index: RwLock<HashMap<TraceId, Vec<usize>>>,
    seen: RwLock<HashSet<EntryId>>,
}

impl InMemoryProvenanceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every entry in arrival order.
    pub async fn all(&self) -> Vec<ProvenanceEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ProvenanceSink for InMemoryProvenanceSink {
    async fn record(&self, entry: ProvenanceEntry) -> Result<()> {
        let mut seen = self.seen.write().await;
        if !seen.insert(entry.entry_id) {
            return Err(Error::duplicate_entry(entry.entry_id));
        }

        let trace_id = entry.trace_id;
        let mut entries = self.entries.write().await;
        let index = entries.len();
        entries.push(entry);

        let mut trace_index = self.trace_index.write().await;
        trace_index.entry(trace_id).or_default().push(index);

        Ok(())
    }

    async fn entries_for_trace(&self, trace_id: TraceId) -> Result<Vec<ProvenanceEntry>> {
        let entries = self.entries.read().await;
        let trace_index = self.trace_index.read().await;

        let mut found: Vec<ProvenanceEntry> = trace_index
            .get(&trace_id)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&i| entries.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by_key(|e| e.seq);
        Ok(found)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Decorator that logs every recorded entry before forwarding it.
pub struct TracingProvenanceSink<S: ProvenanceSink> {
    inner: S,
}

impl<S: ProvenanceSink> TracingProvenanceSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ProvenanceSink> ProvenanceSink for TracingProvenanceSink<S> {
    async fn record(&self, entry: ProvenanceEntry) -> Result<()> {
        if entry.is_rejected() {
            tracing::info!(
                trace_id = %entry.trace_id,
                task_id = %entry.task_id,
                seq = entry.seq,
                check = entry.check.label(),
                outcome = ?entry.outcome,
                "Check rejected"
            );
        } else {
            tracing::debug!(
                trace_id = %entry.trace_id,
                task_id = %entry.task_id,
                seq = entry.seq,
                check = entry.check.label(),
                "Check passed"
            );
        }

        let result = self.inner.record(entry).await;
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Provenance entry not recorded");
        }
        result
    }

    async fn entries_for_trace(&self, trace_id: TraceId) -> Result<Vec<ProvenanceEntry>> {
        tracing::trace!(trace_id = %trace_id, "Reading provenance");
        self.inner.entries_for_trace(trace_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}
