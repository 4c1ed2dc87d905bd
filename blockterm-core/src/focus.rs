//! Focus arbiter.
//!
//! Decides where a keystroke goes: into the focused block's program, into a
//! new command line, or (during a fullscreen hand-off) straight to the
//! connection. Holds a lookup-only reference to at most one block.

use tracing::debug;

use crate::blocks::{Block, BlockId};
use crate::error::SessionError;

/// Where the next input event should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRoute {
    /// A fullscreen program owns the keyboard.
    Fullscreen,
    /// Raw bytes for the focused block.
    Focused(BlockId),
    /// Input is a new command line.
    NewCommand,
    /// A live block exists but is not focused; a new command would be
    /// rejected until it finishes or is focused.
    Blocked(BlockId),
}

#[derive(Debug, Default, Clone)]
pub struct FocusArbiter {
    focused: Option<BlockId>,
    suspended: bool,
}

fn find(blocks: &[Block], id: BlockId) -> Option<&Block> {
    blocks.iter().rev().find(|b| b.id == id)
}

impl FocusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn focused(&self) -> Option<BlockId> {
        self.focused
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn route(&self, blocks: &[Block]) -> InputRoute {
        if self.suspended {
            return InputRoute::Fullscreen;
        }

        if let Some(id) = self.focused {
            if find(blocks, id).is_some_and(Block::accepts_input) {
                return InputRoute::Focused(id);
            }
        }

        match blocks.last() {
            Some(last) if !last.is_terminal() => InputRoute::Blocked(last.id),
            _ => InputRoute::NewCommand,
        }
    }

    /// User-initiated focus. Replaces any previous focus.
    pub fn request(&mut self, id: BlockId, blocks: &[Block]) -> Result<Option<BlockId>, SessionError> {
        if self.suspended {
            return Err(SessionError::BlockInFlight);
        }
        let block = find(blocks, id).ok_or(SessionError::UnknownBlock(id))?;
        if !block.accepts_input() {
            return Err(SessionError::NotFocusable(id));
        }

        let previous = self.focused.replace(id);
        if previous != Some(id) {
            debug!(block = %id, previous = ?previous, "Focus requested");
        }
        Ok(previous)
    }

    /// A block just went live. Continuous and interactive blocks take focus
    /// unless something else already holds it. Returns true if focus moved.
    pub fn on_block_started(&mut self, block: &Block) -> bool {
        if self.suspended || self.focused.is_some() || !block.accepts_input() {
            return false;
        }
        debug!(block = %block.id, "Auto-focus");
        self.focused = Some(block.id);
        true
    }

    /// A block changed status. Focus is dropped once it stops taking input.
    /// Returns true if focus was cleared.
    pub fn on_block_changed(&mut self, block: &Block) -> bool {
        if self.focused == Some(block.id) && !block.accepts_input() {
            debug!(block = %block.id, status = %block.status(), "Focus released");
            self.focused = None;
            return true;
        }
        false
    }

    pub fn clear(&mut self) -> Option<BlockId> {
        self.focused.take()
    }

    /// Fullscreen hand-off begins: all input bypasses arbitration.
    pub fn suspend(&mut self) -> Option<BlockId> {
        self.suspended = true;
        self.focused.take()
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }
}
