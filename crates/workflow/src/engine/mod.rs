//! Process execution engine.
//!
//! The engine drives tokens through a [`CompiledProcess`]:
//! - injects the initial token into every entry task,
//! - fires a task once its place holds a complete joined set,
//! - runs independent firings concurrently, bounded by a semaphore,
//! - calls nested processes on an explicit [`CallStack`],
//! - records every check in the provenance sink.

mod firing;
pub mod stack;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tbcspn_events::{CheckKind, ProvenanceEntry, ProvenanceSink, TaskId, TokenId, TraceId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use firing::{BUNDLE_INPUTS_KEY, BUNDLE_META_KEY};
pub use stack::{CallStack, Frame};

use self::firing::{Fired, FrameContext, Sequence};
use crate::compiler::CompiledProcess;
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{Error, Result};
use crate::guard::ContextProvider;
use crate::place::{JoinError, JoinedSet, Place, SharedPlace, ENTRY_ARC};
use crate::token::Token;

/// One completed firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiringRecord {
    pub task_id: TaskId,
    pub process_id: String,
    /// Token the firing emitted.
    pub token_id: TokenId,
    pub attempts: u32,
    /// Sub-process nesting depth of the firing.
    pub depth: usize,
    /// Number of successor places the output went to.
    pub routes: usize,
    pub elapsed_ms: u64,
}

/// A join still waiting when the run went quiet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalledJoin {
    pub task_id: TaskId,
    pub missing_arcs: Vec<String>,
    pub buffered: usize,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub trace_id: TraceId,
    pub process_id: String,
    /// Output tokens of tasks without successors.
    pub terminal_tokens: Vec<Token>,
    pub firings: Vec<FiringRecord>,
    /// Rejected branches; only filled under [`FailurePolicy::ContinueBranches`].
    pub rejections: Vec<Error>,
    pub stalled_joins: Vec<StalledJoin>,
}

impl RunOutcome {
    fn new(trace_id: TraceId, process_id: impl Into<String>) -> Self {
        Self {
            trace_id,
            process_id: process_id.into(),
            terminal_tokens: Vec::new(),
            firings: Vec::new(),
            rejections: Vec::new(),
            stalled_joins: Vec::new(),
        }
    }

    /// The first terminal token, if any.
    pub fn terminal_token(&self) -> Option<&Token> {
        self.terminal_tokens.first()
    }

    /// No rejections and no stalled joins.
    pub fn is_clean(&self) -> bool {
        self.rejections.is_empty() && self.stalled_joins.is_empty()
    }

    /// How many times `task_id` fired in this frame.
    pub fn fired(&self, task_id: &str) -> usize {
        self.firings.iter().filter(|f| f.task_id == task_id).count()
    }
}

struct EngineInner {
    config: EngineConfig,
    sink: Arc<dyn ProvenanceSink>,
    context: Arc<dyn ContextProvider>,
}

/// Runs compiled processes. Cheap to clone; clones share sink and context.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn ProvenanceSink>,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                sink,
                context,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn sink(&self) -> &Arc<dyn ProvenanceSink> {
        &self.inner.sink
    }

    pub(crate) fn context(&self) -> &Arc<dyn ContextProvider> {
        &self.inner.context
    }

    /// Run `process` to quiescence on the trace of `token`.
    ///
    /// Under [`FailurePolicy::AbortRun`] the first rejection cancels the
    /// remaining firings and is returned as the error. Under
    /// [`FailurePolicy::ContinueBranches`] rejections are collected in the
    /// outcome and independent branches keep running.
    #[tracing::instrument(
        skip_all,
        fields(process_id = %process.process_id(), trace_id = %token.trace_id())
    )]
    pub async fn run(&self, process: Arc<CompiledProcess>, token: Token) -> Result<RunOutcome> {
        let started = Instant::now();
        info!(
            entries = process.entry_tasks().len(),
            tasks = process.task_count(),
            "Starting run"
        );

        let stack = CallStack::new(self.config().max_call_depth);
        let sequence = Arc::new(Sequence::default());
        let result = self.run_frame(process, token, stack, sequence).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(outcome) => info!(
                firings = outcome.firings.len(),
                terminals = outcome.terminal_tokens.len(),
                rejections = outcome.rejections.len(),
                stalled = outcome.stalled_joins.len(),
                duration_ms,
                "Run finished"
            ),
            Err(e) => error!(
                task_id = e.task_id(),
                depth = e.failure_depth(),
                error = %e,
                duration_ms,
                "Run aborted"
            ),
        }
        result
    }

    /// Run one process instance. Boxed so a firing can recurse into a
    /// nested process.
    pub(crate) fn run_frame(
        &self,
        process: Arc<CompiledProcess>,
        token: Token,
        stack: CallStack,
        sequence: Arc<Sequence>,
    ) -> BoxFuture<'static, Result<RunOutcome>> {
        let engine = self.clone();
        async move { engine.drive(process, token, stack, sequence).await }.boxed()
    }

    async fn drive(
        &self,
        process: Arc<CompiledProcess>,
        token: Token,
        stack: CallStack,
        sequence: Arc<Sequence>,
    ) -> Result<RunOutcome> {
        let config = self.config();
        let trace_id = token.trace_id();
        let places = process
            .places()
            .map(|spec| {
                let place = Place::new(
                    spec.task_id.clone(),
                    spec.required_arcs.iter().cloned(),
                    config.join_policy,
                );
                (spec.task_id.clone(), SharedPlace::new(place))
            })
            .collect();
        let frame = Arc::new(FrameContext {
            engine: self.clone(),
            process: Arc::clone(&process),
            stack,
            sequence,
            trace_id,
            places,
            permits: Arc::new(Semaphore::new(config.max_concurrent_firings.max(1))),
        });

        let mut outcome = RunOutcome::new(trace_id, process.process_id());
        let mut firings = JoinSet::new();

        let entries = process.entry_tasks();
        let forks: Vec<Token> = entries.iter().skip(1).map(|_| token.fork()).collect();
        for (entry, token) in entries.iter().zip(std::iter::once(token).chain(forks)) {
            match frame.place(entry)?.arrive(ENTRY_ARC, token).await {
                Ok(Some(joined)) => spawn_firing(&mut firings, &frame, joined),
                Ok(None) => {}
                Err(e) => return Err(Error::join(trace_id, entry.as_str(), e)),
            }
        }

        loop {
            let deadline = match config.join_timeout() {
                Some(timeout) => next_deadline(&frame, timeout).await,
                None => None,
            };

            let joined = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        joined = firings.join_next(), if !firings.is_empty() => joined,
                        () = tokio::time::sleep_until(deadline) => {
                            for failure in expired_joins(&frame, config).await {
                                self.handle_failure(&mut outcome, failure)?;
                            }
                            continue;
                        }
                    }
                }
                None => firings.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Firing ended without a result");
                    continue;
                }
            };

            match result {
                Ok(Fired {
                    record,
                    released,
                    terminal,
                }) => {
                    outcome.firings.push(record);
                    outcome.terminal_tokens.extend(terminal);
                    for joined in released {
                        spawn_firing(&mut firings, &frame, joined);
                    }
                }
                Err(e) => {
                    if let Err(e) = self.handle_failure(&mut outcome, e) {
                        firings.abort_all();
                        return Err(e);
                    }
                }
            }
        }

        for (task_id, place) in &frame.places {
            let buffered = place.pending().await;
            if buffered > 0 {
                let missing_arcs = place.missing_arcs().await;
                warn!(task_id = %task_id, missing = ?missing_arcs, buffered, "Join stalled");
                outcome.stalled_joins.push(StalledJoin {
                    task_id: task_id.clone(),
                    missing_arcs,
                    buffered,
                });
            }
        }

        debug!(
            process_id = %process.process_id(),
            depth = frame.stack.depth(),
            firings = outcome.firings.len(),
            "Frame quiescent"
        );
        Ok(outcome)
    }

    fn handle_failure(&self, outcome: &mut RunOutcome, failure: Error) -> Result<()> {
        match self.config().failure_policy {
            FailurePolicy::AbortRun => Err(failure),
            FailurePolicy::ContinueBranches => {
                warn!(task_id = failure.task_id(), error = %failure, "Branch rejected");
                outcome.rejections.push(failure);
                Ok(())
            }
        }
    }
}

fn spawn_firing(
    firings: &mut JoinSet<Result<Fired>>,
    frame: &Arc<FrameContext>,
    joined: JoinedSet,
) {
    let frame = Arc::clone(frame);
    firings.spawn(async move {
        let task_id = joined.task_id.clone();
        let _permit = Arc::clone(&frame.permits).acquire_owned().await.ok();
        match AssertUnwindSafe(firing::fire(&frame, joined))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::agent_execution(
                frame.trace_id,
                task_id,
                1,
                "firing panicked",
            )),
        }
    });
}

/// Earliest moment a waiting join times out.
async fn next_deadline(frame: &FrameContext, timeout: Duration) -> Option<tokio::time::Instant> {
    let mut earliest = None;
    for place in frame.places.values() {
        let deadline = place.waiting_since().await.and_then(|since| since.checked_add(timeout));
        if let Some(deadline) = deadline {
            earliest = Some(earliest.map_or(deadline, |e: Instant| e.min(deadline)));
        }
    }
    earliest.map(tokio::time::Instant::from_std)
}

/// Fail and empty every join that has waited past the timeout. Each timeout
/// is recorded as a rejected join check.
async fn expired_joins(frame: &FrameContext, config: &EngineConfig) -> Vec<Error> {
    let Some(timeout) = config.join_timeout() else {
        return Vec::new();
    };
    let mut failures = Vec::new();
    for (task_id, place) in &frame.places {
        let Err(e) = place.check_timeout(timeout).await else {
            continue;
        };
        let dropped = place.drain().await;
        warn!(task_id = %task_id, dropped = dropped.len(), error = %e, "Join timed out");

        let arcs = match &e {
            JoinError::Timeout { missing, .. } => missing.clone(),
            _ => Vec::new(),
        };
        let mut entry = ProvenanceEntry::rejected(
            frame.sequence.next(),
            frame.trace_id,
            task_id.as_str(),
            CheckKind::Join { arcs },
            e.to_string(),
        );
        if let Some(token) = dropped.first() {
            entry = entry.with_token(token.token_id());
        }
        let failure = match frame.engine.sink().record(entry).await {
            Ok(()) => Error::join(frame.trace_id, task_id.as_str(), e),
            Err(audit) => Error::audit(frame.trace_id, task_id.as_str(), audit),
        };
        failures.push(failure);
    }
    failures
}
