//! Per-node execution state with compare-and-set transitions.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::EngineError;

/// Lifecycle of a DAG node within one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    Waiting = 0,
    Ready = 1,
    Running = 2,
    CacheHit = 3,
    Built = 4,
    Failed = 5,
    Skipped = 6,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::CacheHit,
            4 => Self::Built,
            5 => Self::Failed,
            _ => Self::Skipped,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CacheHit | Self::Built | Self::Failed | Self::Skipped
        )
    }

    /// The node's outputs are available to dependents.
    pub fn is_success(self) -> bool {
        matches!(self, Self::CacheHit | Self::Built)
    }

    /// Whether `self -> to` is a legal edge of the state machine.
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Waiting, Self::Ready | Self::Skipped)
                | (Self::Ready, Self::Running | Self::Skipped)
                | (
                    Self::Running,
                    Self::CacheHit | Self::Built | Self::Failed | Self::Skipped
                )
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::CacheHit => "cache-hit",
            Self::Built => "built",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Atomic holder of a [`NodeState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(NodeState::Waiting as u8))
    }

    pub fn load(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to` atomically.
    ///
    /// # Errors
    /// Returns [`EngineError::Internal`] if the edge is illegal or the cell
    /// no longer holds `from`.
    pub fn transition(&self, from: NodeState, to: NodeState) -> Result<(), EngineError> {
        if !from.can_transition(to) {
            return Err(EngineError::Internal {
                message: format!("illegal node transition {from} -> {to}"),
            });
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| EngineError::Internal {
                message: format!(
                    "node transition {from} -> {to} raced: state is {}",
                    NodeState::from_u8(actual)
                ),
            })
    }
}
