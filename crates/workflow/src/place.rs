//! Places: per-task input buffers implementing the AND-join.
//!
//! Each task owns one place with one slot per required incoming arc. An arc
//! is named after the task that produces it; entry tasks have the single
//! [`ENTRY_ARC`]. The place releases a [`JoinedSet`] once every required arc
//! holds a token, then clears those slots.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tbcspn_events::TaskId;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::token::Token;

/// Arc name for tokens injected at the start of a run.
pub const ENTRY_ARC: &str = "__entry__";

/// Handling of a second arrival on an arc that already holds a token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Protocol violation.
    #[default]
    RejectDuplicate,
    /// Newest token wins.
    Replace,
    /// Buffer in arrival order; each release takes the oldest per arc.
    Queue,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("duplicate arrival on arc '{arc}' of task '{task_id}'")]
    DuplicateArrival { task_id: TaskId, arc: String },

    #[error("task '{task_id}' has no incoming arc '{arc}'")]
    UnknownArc { task_id: TaskId, arc: String },

    #[error("join at task '{task_id}' timed out after {waited_ms}ms waiting for {missing:?}")]
    Timeout {
        task_id: TaskId,
        missing: Vec<String>,
        waited_ms: u64,
    },
}

/// One complete set of arrivals, ordered by arc name.
#[derive(Debug, Clone)]
pub struct JoinedSet {
    pub task_id: TaskId,
    pub tokens: Vec<(String, Token)>,
}

impl JoinedSet {
    /// Arc names in the set, sorted.
    pub fn arcs(&self) -> Vec<String> {
        self.tokens.iter().map(|(arc, _)| arc.clone()).collect()
    }

    /// Number of joined tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when the set holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Drop the arc names, keeping tokens in arc order.
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens.into_iter().map(|(_, token)| token).collect()
    }
}

/// Input buffer of a single task.
#[derive(Debug)]
pub struct Place {
    task_id: TaskId,
    required: BTreeSet<String>,
    slots: BTreeMap<String, VecDeque<Token>>,
    policy: JoinPolicy,
    waiting_since: Option<Instant>,
    released: u64,
}

impl Place {
    /// Empty place waiting on one token per required arc.
    pub fn new<I, S>(task_id: impl Into<TaskId>, required: I, policy: JoinPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_id: task_id.into(),
            required: required.into_iter().map(Into::into).collect(),
            slots: BTreeMap::new(),
            policy,
            waiting_since: None,
            released: 0,
        }
    }

    /// Task this place feeds.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Arcs that must all be filled before release.
    pub const fn required_arcs(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Accept a token on an arc. Returns the joined set when this arrival
    /// completes one.
    pub fn arrive(&mut self, arc: &str, token: Token) -> Result<Option<JoinedSet>, JoinError> {
        if !self.required.contains(arc) {
            return Err(JoinError::UnknownArc {
                task_id: self.task_id.clone(),
                arc: arc.to_string(),
            });
        }

        let slot = self.slots.entry(arc.to_string()).or_default();
        match (self.policy, slot.is_empty()) {
            (_, true) | (JoinPolicy::Queue, false) => slot.push_back(token),
            (JoinPolicy::Replace, false) => {
                slot.clear();
                slot.push_back(token);
            }
            (JoinPolicy::RejectDuplicate, false) => {
                return Err(JoinError::DuplicateArrival {
                    task_id: self.task_id.clone(),
                    arc: arc.to_string(),
                });
            }
        }

        if self.waiting_since.is_none() {
            self.waiting_since = Some(Instant::now());
        }

        Ok(self.try_release())
    }

    fn try_release(&mut self) -> Option<JoinedSet> {
        let complete = self
            .required
            .iter()
            .all(|arc| self.slots.get(arc).is_some_and(|slot| !slot.is_empty()));
        if !complete {
            return None;
        }

        let tokens = self
            .required
            .iter()
            .filter_map(|arc| {
                let token = self.slots.get_mut(arc)?.pop_front()?;
                Some((arc.clone(), token))
            })
            .collect();

        self.released = self.released.saturating_add(1);
        self.waiting_since = (self.pending() > 0).then(Instant::now);

        Some(JoinedSet {
            task_id: self.task_id.clone(),
            tokens,
        })
    }

    /// Tokens buffered and not yet released.
    pub fn pending(&self) -> usize {
        self.slots.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Required arcs with no token buffered.
    pub fn missing_arcs(&self) -> Vec<String> {
        self.required
            .iter()
            .filter(|arc| self.slots.get(*arc).map_or(true, VecDeque::is_empty))
            .cloned()
            .collect()
    }

    /// When the oldest unreleased arrival came in.
    pub const fn waiting_since(&self) -> Option<Instant> {
        self.waiting_since
    }

    /// Number of joined sets released so far.
    pub const fn released(&self) -> u64 {
        self.released
    }

    /// Fail if a partial arrival set has waited longer than `timeout`.
    pub fn check_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        match self.waiting_since {
            Some(since) if since.elapsed() >= timeout => Err(JoinError::Timeout {
                task_id: self.task_id.clone(),
                missing: self.missing_arcs(),
                waited_ms: u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
            _ => Ok(()),
        }
    }

    /// Drop every buffered token.
    pub fn drain(&mut self) -> Vec<Token> {
        self.waiting_since = None;
        std::mem::take(&mut self.slots)
            .into_values()
            .flatten()
            .collect()
    }
}

/// A place behind an async mutex. Arrival and release happen under one lock
/// acquisition, so concurrent arrivals release a set exactly once.
#[derive(Debug, Clone)]
pub struct SharedPlace {
    inner: Arc<Mutex<Place>>,
}

impl SharedPlace {
    pub fn new(place: Place) -> Self {
        Self {
            inner: Arc::new(Mutex::new(place)),
        }
    }

    pub async fn arrive(&self, arc: &str, token: Token) -> Result<Option<JoinedSet>, JoinError> {
        self.inner.lock().await.arrive(arc, token)
    }

    pub async fn missing_arcs(&self) -> Vec<String> {
        self.inner.lock().await.missing_arcs()
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.pending()
    }

    pub async fn waiting_since(&self) -> Option<Instant> {
        self.inner.lock().await.waiting_since()
    }

    pub async fn check_timeout(&self, timeout: Duration) -> Result<(), JoinError> {
        self.inner.lock().await.check_timeout(timeout)
    }

    pub async fn released(&self) -> u64 {
        self.inner.lock().await.released()
    }

    pub async fn drain(&self) -> Vec<Token> {
        self.inner.lock().await.drain()
    }
}
