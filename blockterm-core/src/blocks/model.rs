//! Block model.
//!
//! A block is one command execution: the text that was submitted, how the
//! classifier sees it, its status and the processed output it produced.
//! Terminal blocks are frozen; every mutator checks that first.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BlockError;
use crate::runtime::{Classification, CommandProfile};
use crate::term::{EncodingHint, Fragment, OutputProcessor, Processed};

/// Monotonic index of a block within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Pending,
    Running,
    Interactive,
    Completed,
    Failed,
    Cancelled,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BlockStatus::Completed | BlockStatus::Failed | BlockStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BlockStatus) -> bool {
        use BlockStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Interactive | Completed | Failed | Cancelled),
            Interactive => next.is_terminal(),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Running => "running",
            BlockStatus::Interactive => "interactive",
            BlockStatus::Completed => "completed",
            BlockStatus::Failed => "failed",
            BlockStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Where a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockOrigin {
    /// Submitted by the user.
    Command,
    /// Appended when a fullscreen program exits; carries a summary, not output.
    FullscreenSummary,
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub command: String,
    pub classification: Classification,
    pub fullscreen_required: bool,
    pub origin: BlockOrigin,
    pub cwd: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,

    status: BlockStatus,
    output: Vec<String>,
    completed_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,

    processor: OutputProcessor,
    // The shell echoes the command line back before the command's output.
    awaiting_echo: bool,
    echo_buf: String,
}

impl Block {
    pub fn new(id: BlockId, command: impl Into<String>, profile: &CommandProfile) -> Self {
        let command = command.into();
        let awaiting_echo = !command.trim().is_empty();
        Self {
            id,
            command,
            classification: profile.classification,
            fullscreen_required: profile.fullscreen_required,
            origin: BlockOrigin::Command,
            cwd: None,
            summary: None,
            created_at: Utc::now(),
            status: BlockStatus::Pending,
            output: Vec::new(),
            completed_at: None,
            exit_code: None,
            processor: OutputProcessor::block(),
            awaiting_echo,
            echo_buf: String::new(),
        }
    }

    /// A finished fullscreen program, reported as a block of its own.
    pub fn fullscreen_summary(
        id: BlockId,
        command: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        let mut block = Self::new(
            id,
            command,
            &CommandProfile {
                classification: Classification::Interactive,
                fullscreen_required: true,
                executable: String::new(),
            },
        );
        block.origin = BlockOrigin::FullscreenSummary;
        block.summary = Some(summary.into());
        block.awaiting_echo = false;
        block
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Continuous/interactive programs that are still alive take raw input.
    pub fn accepts_input(&self) -> bool {
        matches!(self.classification, Classification::Continuous | Classification::Interactive)
            && matches!(self.status, BlockStatus::Running | BlockStatus::Interactive)
    }

    /// Processed output chunks, in arrival order.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn output_text(&self) -> String {
        self.output.concat()
    }

    /// Time from creation to completion; `None` while the block is live.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    fn transition(&mut self, next: BlockStatus) -> Result<(), BlockError> {
        if self.status.is_terminal() {
            return Err(BlockError::Terminal { id: self.id, status: self.status });
        }
        if !self.status.can_transition_to(next) {
            return Err(BlockError::InvalidTransition { from: self.status, to: next });
        }

        debug!(block = %self.id, from = %self.status, to = %next, "Block transition");
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.flush_echo();
        }
        Ok(())
    }

    /// Pending -> Running, once the command is on the wire.
    pub fn start(&mut self) -> Result<(), BlockError> {
        self.transition(BlockStatus::Running)
    }

    /// Running -> Interactive, when the program starts taking input.
    pub fn mark_interactive(&mut self) -> Result<(), BlockError> {
        self.transition(BlockStatus::Interactive)
    }

    /// Finish with a reported exit code. `None` or 0 completes, anything
    /// else fails.
    pub fn complete(&mut self, exit_code: Option<i32>) -> Result<(), BlockError> {
        let next = match exit_code {
            None | Some(0) => BlockStatus::Completed,
            Some(_) => BlockStatus::Failed,
        };
        self.finish(next, exit_code)
    }

    /// Move to an explicit final status.
    pub fn finish(&mut self, status: BlockStatus, exit_code: Option<i32>) -> Result<(), BlockError> {
        if !status.is_terminal() {
            return Err(BlockError::InvalidTransition { from: self.status, to: status });
        }
        self.transition(status)?;
        self.exit_code = exit_code;
        Ok(())
    }

    /// Optimistic cancellation. Returns `false` (and changes nothing) if the
    /// block had already finished.
    pub fn cancel(&mut self) -> bool {
        self.transition(BlockStatus::Cancelled).is_ok()
    }

    /// Decode a chunk of connection output with this block's processor.
    /// The caller decides which fragments land in the buffer.
    pub fn process(&mut self, bytes: &[u8], hint: EncodingHint) -> Result<Vec<Fragment>, BlockError> {
        if self.is_terminal() {
            return Err(BlockError::Terminal { id: self.id, status: self.status });
        }
        match self.processor.process(bytes, hint) {
            Processed::Block(fragments) => Ok(fragments),
            raw => Ok(vec![Fragment::Text(raw.text())]),
        }
    }

    /// Append processed text. Returns whether the buffer changed.
    pub fn append_text(&mut self, text: &str) -> Result<bool, BlockError> {
        if self.is_terminal() {
            return Err(BlockError::Terminal { id: self.id, status: self.status });
        }
        if text.is_empty() {
            return Ok(false);
        }

        let text = if self.awaiting_echo {
            match self.strip_echo(text) {
                Some(rest) => rest,
                None => return Ok(false),
            }
        } else {
            text.to_string()
        };

        if text.is_empty() {
            return Ok(false);
        }
        self.output.push(text);
        Ok(true)
    }

    /// Drop everything received so far and wait for the echo again, for
    /// when the shell's first prompt turns up after the command was sent.
    /// Returns whether any output was dropped.
    pub fn restart_output(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let dropped = !self.output.is_empty();
        self.output.clear();
        self.echo_buf.clear();
        self.awaiting_echo = !self.command.trim().is_empty();
        dropped
    }

    /// Remove the unfinished last line, such as a shell prompt.
    pub fn drop_trailing_line(&mut self) {
        if self.is_terminal() {
            return;
        }
        while let Some(last) = self.output.last_mut() {
            match last.rfind('\n') {
                Some(idx) => {
                    last.truncate(idx + 1);
                    break;
                }
                None => {
                    self.output.pop();
                }
            }
        }
    }

    /// Last line of output with styling removed, for prompt detection.
    pub fn trailing_line(&self) -> String {
        let line = match self.output.last() {
            Some(chunk) if !chunk.ends_with('\n') => {
                let text = self.output_text();
                match text.rfind('\n') {
                    Some(idx) => text[idx + 1..].to_string(),
                    None => text,
                }
            }
            _ => return String::new(),
        };
        strip_sgr(&line)
    }

    // Buffers text until the first line is complete, then drops it if it is
    // the echoed command. `None` means keep waiting.
    fn strip_echo(&mut self, text: &str) -> Option<String> {
        self.echo_buf.push_str(text);
        let wanted = self.command.trim();

        let Some(nl) = self.echo_buf.find('\n') else {
            let plain = strip_sgr(&self.echo_buf);
            // still waiting on the echo, maybe behind a fresh prompt
            if wanted.starts_with(plain.trim_start()) || is_echo(&plain, wanted) || ends_like_prompt(&plain) {
                return None;
            }
            self.awaiting_echo = false;
            return Some(std::mem::take(&mut self.echo_buf));
        };

        self.awaiting_echo = false;
        let buf = std::mem::take(&mut self.echo_buf);
        let first = strip_sgr(&buf[..nl]);
        if is_echo(&first, wanted) {
            Some(buf[nl + 1..].to_string())
        } else {
            Some(buf)
        }
    }

    fn flush_echo(&mut self) {
        self.awaiting_echo = false;
        if !self.echo_buf.is_empty() {
            let pending = std::mem::take(&mut self.echo_buf);
            if strip_sgr(&pending).trim() != self.command.trim() {
                self.output.push(pending);
            }
        }
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            id: self.id,
            command: self.command.clone(),
            classification: self.classification,
            fullscreen_required: self.fullscreen_required,
            origin: self.origin,
            status: self.status,
            accepts_input: self.accepts_input(),
            output: self.output_text(),
            summary: self.summary.clone(),
            cwd: self.cwd.clone(),
            exit_code: self.exit_code,
            created_at: self.created_at,
            completed_at: self.completed_at,
            duration_ms: self.duration().map(|d| d.num_milliseconds()),
        }
    }
}

/// Presentation-free copy of a block for renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub id: BlockId,
    pub command: String,
    pub classification: Classification,
    pub fullscreen_required: bool,
    pub origin: BlockOrigin,
    pub status: BlockStatus,
    pub accepts_input: bool,
    pub output: String,
    pub summary: Option<String>,
    pub cwd: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

// The echoed line is the command itself, possibly behind a prompt.
fn is_echo(line: &str, wanted: &str) -> bool {
    let line = line.trim_end();
    match line.strip_suffix(wanted) {
        Some(prefix) => ends_like_prompt(prefix),
        None => false,
    }
}

// `$ `, `user@host:~$`, `host% `, `> ` or nothing at all.
fn ends_like_prompt(s: &str) -> bool {
    let s = s.trim_end();
    s.is_empty() || s.ends_with(['$', '#', '>', '%'])
}

fn strip_sgr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c in chars.by_ref() {
                if c == 'm' {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
