//! Explicit call stack for nested sub-process invocation.
//!
//! Frames are pushed onto a persistent vector, so every firing holds its own
//! cheap snapshot of the stack and a nested call never disturbs siblings.

use im::Vector;
use tbcspn_events::{TaskId, TokenId};

/// One active sub-process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Process being called.
    pub process_id: String,
    /// Task in the calling process whose action is this call.
    pub caller_task: TaskId,
    /// Token the caller handed to the call.
    pub caller_token: TokenId,
    /// Places the caller deposits the call's result into.
    pub return_places: Vec<TaskId>,
}

/// Depth-bounded stack of frames. Depth 0 is the top-level process.
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vector<Frame>,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vector::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// A new stack with `frame` on top, or `None` past the depth limit.
    pub fn push(&self, frame: Frame) -> Option<CallStack> {
        if self.frames.len() >= self.max_depth {
            return None;
        }
        let mut frames = self.frames.clone();
        frames.push_back(frame);
        Some(Self {
            frames,
            max_depth: self.max_depth,
        })
    }

    /// Pop the top frame, returning it with the remaining stack.
    pub fn pop(&self) -> Option<(Frame, CallStack)> {
        let mut frames = self.frames.clone();
        let top = frames.pop_back()?;
        Some((
            top,
            Self {
                frames,
                max_depth: self.max_depth,
            },
        ))
    }

    /// Process ids from the outermost call inwards.
    pub fn path(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.process_id.as_str()).collect()
    }
}
