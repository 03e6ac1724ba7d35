//! One task firing: validate, merge, guard, execute, emit.
//!
//! Every check records a provenance entry before its outcome takes effect.
//! A rejection is recorded first and only then returned as an error, so the
//! sink always holds the reason a token stopped.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use itertools::Itertools;
use serde_json::Value;
use tbcspn_events::{CheckKind, ProvenanceEntry, Stage, TaskId, TokenId, TraceId};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::stack::{CallStack, Frame};
use super::{Engine, FiringRecord};
use crate::compiler::{CompiledProcess, CompiledTask};
use crate::config::ValidationMode;
use crate::error::{Error, Result};
use crate::guard::GuardVerdict;
use crate::handler::{ActionBinding, ActionContext, ActionError, TaskAction};
use crate::place::{JoinedSet, SharedPlace};
use crate::schema::validator;
use crate::schema::TokenSpec;
use crate::task::{MergeStrategy, TaskState};
use crate::token::{Content, Token};

/// Key holding the constituent contents of a bundled merge.
pub const BUNDLE_INPUTS_KEY: &str = "__inputs__";
/// Marker key set on bundled content.
pub const BUNDLE_META_KEY: &str = "__meta__";

/// Run-wide provenance sequence, shared by nested frames.
#[derive(Debug, Default)]
pub(crate) struct Sequence(AtomicU64);

impl Sequence {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Everything a firing needs from the process instance it runs in.
pub(crate) struct FrameContext {
    pub(crate) engine: Engine,
    pub(crate) process: Arc<CompiledProcess>,
    pub(crate) stack: CallStack,
    pub(crate) sequence: Arc<Sequence>,
    pub(crate) trace_id: TraceId,
    pub(crate) places: BTreeMap<TaskId, SharedPlace>,
    pub(crate) permits: Arc<Semaphore>,
}

impl FrameContext {
    pub(crate) fn place(&self, task_id: &str) -> Result<&SharedPlace> {
        self.places.get(task_id).ok_or_else(|| Error::UnknownTask {
            trace_id: self.trace_id,
            task_id: task_id.to_string(),
        })
    }
}

/// Result of a successful firing, handed back to the frame loop.
pub(crate) struct Fired {
    pub(crate) record: FiringRecord,
    /// Joins completed by this firing's deposits.
    pub(crate) released: Vec<JoinedSet>,
    /// Output token of a task with no successors.
    pub(crate) terminal: Option<Token>,
}

struct Firing<'a> {
    frame: &'a FrameContext,
    task: &'a CompiledTask,
    state: TaskState,
}

#[tracing::instrument(
    skip_all,
    fields(task_id = %joined.task_id, depth = frame.stack.depth())
)]
pub(crate) async fn fire(frame: &FrameContext, joined: JoinedSet) -> Result<Fired> {
    let started = Instant::now();
    let task = frame
        .process
        .task(&joined.task_id)
        .ok_or_else(|| Error::UnknownTask {
            trace_id: frame.trace_id,
            task_id: joined.task_id.clone(),
        })?;
    let mut firing = Firing {
        frame,
        task,
        state: TaskState::Pending,
    };

    firing.advance(TaskState::Validating)?;
    let arcs = joined.arcs();
    let mut inputs = Vec::with_capacity(arcs.len());
    for (_, token) in joined.tokens {
        inputs.push(firing.validate(token, Stage::Input, task.input_spec()).await?);
    }
    let input = firing.merge(inputs, arcs).await?;

    firing.advance(TaskState::Guarding)?;
    let input = firing.check_guards(input).await?;

    firing.advance(TaskState::Executing)?;
    let (content, nested, attempts) = firing.execute(&input).await?;

    firing.advance(TaskState::Emitting)?;
    let output = match nested {
        Some(terminal) => {
            Token::merge(frame.trace_id, &[input, terminal], content).emitted_by(task.task_id())
        }
        None => input.derive(content, task.task_id()),
    };
    let output = firing
        .validate(output, Stage::Output, task.output_spec())
        .await?;

    firing.advance(TaskState::Fired)?;
    let entry = firing.record(output.token_id(), CheckKind::Firing, None).await?;
    let output = output.with_entry(entry);
    let token_id = output.token_id();

    let successors = frame.process.successors(task.task_id());
    let (released, terminal) = firing.deposit(output, successors).await?;

    let record = FiringRecord {
        task_id: task.task_id().to_string(),
        process_id: frame.process.process_id().to_string(),
        token_id,
        attempts,
        depth: frame.stack.depth(),
        routes: successors.len(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    debug!(routes = record.routes, elapsed_ms = record.elapsed_ms, "Task fired");

    Ok(Fired {
        record,
        released,
        terminal,
    })
}

impl Firing<'_> {
    fn trace_id(&self) -> TraceId {
        self.frame.trace_id
    }

    fn task_id(&self) -> &str {
        self.task.task_id()
    }

    fn subprocess_failed(&self, process_id: &str, depth: usize, nested: Error) -> Error {
        Error::subprocess_failed(self.trace_id(), self.task_id(), process_id, depth, nested)
    }

    fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                trace_id: self.trace_id(),
                task_id: self.task_id().to_string(),
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "Task state changed");
        self.state = next;
        Ok(())
    }

    /// Record one check. `reason` marks the check as rejected.
    async fn record(
        &self,
        token_id: TokenId,
        check: CheckKind,
        reason: Option<String>,
    ) -> Result<ProvenanceEntry> {
        let seq = self.frame.sequence.next();
        let entry = match reason {
            None => ProvenanceEntry::passed(seq, self.trace_id(), self.task_id(), check),
            Some(reason) => {
                ProvenanceEntry::rejected(seq, self.trace_id(), self.task_id(), check, reason)
            }
        }
        .with_token(token_id);

        self.frame
            .engine
            .sink()
            .record(entry.clone())
            .await
            .map_err(|e| Error::audit(self.trace_id(), self.task_id(), e))?;
        Ok(entry)
    }

    /// Record a rejection, then hand back `error` for the caller to return.
    async fn reject(&mut self, token_id: TokenId, check: CheckKind, error: Error) -> Error {
        self.state = TaskState::Rejected;
        warn!(check = check.label(), error = %error, "Token rejected");
        match self.record(token_id, check, Some(error.to_string())).await {
            Ok(_) => error,
            Err(audit) => audit,
        }
    }

    async fn validate(&mut self, token: Token, stage: Stage, spec: &TokenSpec) -> Result<Token> {
        let violations = match self.frame.engine.config().validation_mode {
            ValidationMode::FailFast => validator::check(token.content(), spec)
                .err()
                .into_iter()
                .collect(),
            ValidationMode::Aggregate => validator::check_all(token.content(), spec),
        };
        let check = CheckKind::Validation {
            stage,
            spec_id: spec.spec_id.clone(),
        };

        if violations.is_empty() {
            let entry = self.record(token.token_id(), check, None).await?;
            return Ok(token.with_entry(entry));
        }

        let error = Error::schema_violation(self.trace_id(), self.task_id(), stage, violations);
        Err(self.reject(token.token_id(), check, error).await)
    }

    async fn merge(&mut self, mut inputs: Vec<Token>, arcs: Vec<String>) -> Result<Token> {
        if inputs.len() == 1 {
            if let Some(token) = inputs.pop() {
                return Ok(token);
            }
        }

        let check = CheckKind::Join { arcs };
        let content = match self.task.spec().merge_strategy {
            MergeStrategy::Strict => match merge_strict(&inputs) {
                Ok(content) => content,
                Err(field) => {
                    let blame = inputs.first().map(Token::token_id).unwrap_or_default();
                    let error = Error::MergeConflict {
                        trace_id: self.trace_id(),
                        task_id: self.task_id().to_string(),
                        field,
                    };
                    return Err(self.reject(blame, check, error).await);
                }
            },
            MergeStrategy::Union => merge_union(&inputs),
            MergeStrategy::Bundle => bundle(&inputs),
        };

        let merged = Token::merge(self.trace_id(), &inputs, content);
        let entry = self.record(merged.token_id(), check, None).await?;
        Ok(merged.with_entry(entry))
    }

    async fn check_guards(&mut self, mut token: Token) -> Result<Token> {
        let (frame, task) = (self.frame, self.task);
        let context = frame.engine.context();
        for guard in &task.spec().guards {
            let verdict = guard.evaluate(&token, context.as_ref());
            let check = CheckKind::Guard {
                guard_id: guard.guard_id.clone(),
                topic: guard.target_topic_id.clone(),
                score: verdict.score(),
                threshold: verdict.threshold(),
            };
            match verdict {
                GuardVerdict::Admit { .. } => {
                    let entry = self.record(token.token_id(), check, None).await?;
                    token = token.with_entry(entry);
                }
                GuardVerdict::Reject {
                    score, threshold, ..
                } => {
                    let error = Error::GuardRejection {
                        trace_id: self.trace_id(),
                        task_id: self.task_id().to_string(),
                        guard_id: guard.guard_id.clone(),
                        topic: guard.target_topic_id.clone(),
                        score,
                        threshold,
                    };
                    return Err(self.reject(token.token_id(), check, error).await);
                }
            }
        }
        Ok(token)
    }

    /// Output content, the nested terminal token for a sub-process call,
    /// and the number of attempts used.
    async fn execute(&mut self, input: &Token) -> Result<(Content, Option<Token>, u32)> {
        let task = self.task;
        match task.binding() {
            ActionBinding::Native { action, .. } => {
                let (content, attempts) = self.invoke(action.as_ref(), input).await?;
                Ok((content, None, attempts))
            }
            ActionBinding::Subprocess { process, .. } => {
                let terminal = self.call(process, input).await?;
                Ok((terminal.content().clone(), Some(terminal), 1))
            }
        }
    }

    async fn invoke(&mut self, action: &dyn TaskAction, input: &Token) -> Result<(Content, u32)> {
        let (frame, task) = (self.frame, self.task);
        let config = frame.engine.config();
        let policy = task.spec().retry.unwrap_or(config.default_retry);
        let max_attempts = policy.max_attempts.max(1);
        let limit = config.action_timeout();
        let mut attempt = 1u32;

        loop {
            let ctx = ActionContext {
                trace_id: self.trace_id(),
                task_id: self.task_id().to_string(),
                process_id: frame.process.process_id().to_string(),
                attempt,
                call_depth: frame.stack.depth(),
            };
            debug!(action = action.name(), attempt, max_attempts, "Invoking action");

            let call = AssertUnwindSafe(action.invoke(input.content(), &task.spec().config, &ctx))
                .catch_unwind()
                .map(|outcome| outcome.unwrap_or_else(|payload| Err(panicked(&*payload))));
            let result = match limit {
                Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                None => Some(call.await),
            };

            match result {
                Some(Ok(content)) => return Ok((content, attempt)),
                Some(Err(e)) => {
                    warn!(attempt, retryable = e.retryable, error = %e, "Action attempt failed");
                    if !e.retryable || attempt >= max_attempts {
                        let error = Error::agent_execution(
                            self.trace_id(),
                            self.task_id(),
                            attempt,
                            e.message,
                        );
                        return Err(self.reject(input.token_id(), CheckKind::Firing, error).await);
                    }
                }
                None => {
                    let timeout_ms = limit
                        .map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX))
                        .unwrap_or_default();
                    warn!(attempt, timeout_ms, "Action timed out");
                    if attempt >= max_attempts {
                        let error = Error::ActionTimeout {
                            trace_id: self.trace_id(),
                            task_id: self.task_id().to_string(),
                            attempts: attempt,
                            timeout_ms,
                        };
                        return Err(self.reject(input.token_id(), CheckKind::Firing, error).await);
                    }
                }
            }

            tokio::time::sleep(policy.backoff(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Run `callee` as a nested process instance on the same trace.
    async fn call(&mut self, callee: &Arc<CompiledProcess>, input: &Token) -> Result<Token> {
        let process_id = callee.process_id().to_string();
        let frame = Frame {
            process_id: process_id.clone(),
            caller_task: self.task_id().to_string(),
            caller_token: input.token_id(),
            return_places: self.frame.process.successors(self.task_id()).to_vec(),
        };

        let Some(stack) = self.frame.stack.push(frame) else {
            let check = CheckKind::Call {
                process_id: process_id.clone(),
                depth: self.frame.stack.depth().saturating_add(1),
            };
            let error = Error::CallDepthExceeded {
                trace_id: self.trace_id(),
                task_id: self.task_id().to_string(),
                process_id,
                max_depth: self.frame.stack.max_depth(),
            };
            return Err(self.reject(input.token_id(), check, error).await);
        };
        let depth = stack.depth();

        let argument = input.fork();
        let entry = self
            .record(
                argument.token_id(),
                CheckKind::Call {
                    process_id: process_id.clone(),
                    depth,
                },
                None,
            )
            .await?;
        let argument = argument.with_entry(entry);

        info!(process_id = %process_id, depth, path = ?stack.path(), "Entering sub-process");
        let nested = self.frame.engine.run_frame(
            Arc::clone(callee),
            argument,
            stack,
            Arc::clone(&self.frame.sequence),
        );
        let result = match self.frame.engine.config().call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, nested).await {
                Ok(result) => result,
                Err(_) => Err(Error::ActionTimeout {
                    trace_id: self.trace_id(),
                    task_id: self.task_id().to_string(),
                    attempts: 1,
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => nested.await,
        };

        let returned = CheckKind::Return {
            process_id: process_id.clone(),
            depth,
        };
        let error = match result {
            Ok(mut outcome) if !outcome.terminal_tokens.is_empty() => {
                let terminal = outcome.terminal_tokens.swap_remove(0);
                let entry = self.record(terminal.token_id(), returned, None).await?;
                info!(process_id = %process_id, depth, "Returned from sub-process");
                return Ok(terminal.with_entry(entry));
            }
            Ok(mut outcome) if !outcome.rejections.is_empty() => {
                let nested = outcome.rejections.swap_remove(0);
                self.subprocess_failed(&process_id, depth, nested)
            }
            Ok(_) => Error::NoTerminalToken {
                trace_id: self.trace_id(),
                task_id: self.task_id().to_string(),
                process_id: process_id.clone(),
            },
            Err(nested) => self.subprocess_failed(&process_id, depth, nested),
        };
        Err(self.reject(input.token_id(), returned, error).await)
    }

    /// Hand the output to every successor place. Extra successors get a fork.
    async fn deposit(
        &self,
        output: Token,
        successors: &[TaskId],
    ) -> Result<(Vec<JoinedSet>, Option<Token>)> {
        if successors.is_empty() {
            return Ok((Vec::new(), Some(output)));
        }

        let forks: Vec<Token> = successors.iter().skip(1).map(|_| output.fork()).collect();
        let mut released = Vec::new();
        for (next, token) in successors.iter().zip(std::iter::once(output).chain(forks)) {
            let place = self.frame.place(next)?;
            match place.arrive(self.task_id(), token).await {
                Ok(Some(joined)) => released.push(joined),
                Ok(None) => debug!(next = %next, "Token waiting at join"),
                Err(e) => return Err(Error::join(self.trace_id(), next.as_str(), e)),
            }
        }
        Ok((released, None))
    }
}

/// A panicking action fails its attempt like a transient error.
fn panicked(payload: &(dyn Any + Send)) -> ActionError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ActionError::transient(format!("action panicked: {detail}"))
}

/// Union of all fields; a field present in several inputs with different
/// values is a conflict.
fn merge_strict(inputs: &[Token]) -> std::result::Result<Content, String> {
    let mut merged = Content::new();
    for (key, value) in inputs.iter().flat_map(|t| t.content().iter()) {
        match merged.get(key) {
            Some(existing) if existing != value => return Err(key.clone()),
            Some(_) => {}
            None => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(merged)
}

/// Union of all fields; later arcs overwrite earlier ones.
fn merge_union(inputs: &[Token]) -> Content {
    inputs
        .iter()
        .flat_map(|t| t.content().iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn bundle(inputs: &[Token]) -> Content {
    let mut content = Content::new();
    content.insert(
        BUNDLE_INPUTS_KEY.to_string(),
        Value::Array(
            inputs
                .iter()
                .map(|t| Value::Object(t.content().clone()))
                .collect_vec(),
        ),
    );
    content.insert(BUNDLE_META_KEY.to_string(), Value::from("bundled"));
    content
}
