//! Error taxonomy for the session engine.
//!
//! Everything here resolves to a rejected call or a block status transition.
//! Malformed output and ambiguous classifications never surface as errors;
//! they are recovered where they happen.

use thiserror::Error;

use crate::blocks::{BlockId, BlockStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection is gone (explicit close or the remote end exited).
    #[error("session is closed")]
    SessionClosed,

    /// Another block-mode command (or a fullscreen hand-off) is still running.
    #[error("another block is still in flight")]
    BlockInFlight,

    /// Raw input arrived while no block is focused.
    #[error("no block is focused to receive input")]
    NoFocusTarget,

    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    /// The block exists but is not currently accepting input.
    #[error("block {0} does not accept input")]
    NotFocusable(BlockId),

    /// Exclusive access to the connection could not be established.
    #[error("fullscreen hand-off unavailable: {0}")]
    HandoffUnavailable(String),

    #[error("connection error: {0}")]
    Connection(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Terminal blocks are immutable: no more output, no more transitions.
    #[error("block {id} is already {status}")]
    Terminal { id: BlockId, status: BlockStatus },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: BlockStatus, to: BlockStatus },
}
