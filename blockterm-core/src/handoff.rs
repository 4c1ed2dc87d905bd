//! Fullscreen hand-off.
//!
//! Editors, pagers and monitors need a real terminal. While one runs, the
//! connection's output bypasses block processing and goes untouched to a
//! terminal-emulation collaborator, and every keystroke goes straight back
//! to the connection. When the program exits, block mode resumes and the
//! run is reported as a summary block.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blocks::{BlockId, BlockStatus};
use crate::error::SessionError;
use crate::term::{EncodingHint, ModeChange, ModeSnapshot, OscEvent, OutputProcessor, Processed};

/// Bytes the emulator wants written to the connection (keystrokes, replies
/// to terminal queries).
#[derive(Debug, Clone)]
pub struct InputSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl InputSink {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Returns false once the session has stopped listening.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx.send(bytes.into()).is_ok()
    }
}

/// How a fullscreen program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullscreenExit {
    pub exit_code: Option<i32>,
    /// The program exited on its own (as opposed to being torn down).
    pub graceful: bool,
}

impl FullscreenExit {
    pub fn exited(exit_code: Option<i32>) -> Self {
        Self { exit_code, graceful: true }
    }

    pub fn aborted(exit_code: Option<i32>) -> Self {
        Self { exit_code, graceful: false }
    }

    pub fn final_status(&self) -> BlockStatus {
        match (self.graceful, self.exit_code) {
            (_, Some(code)) if code != 0 => BlockStatus::Failed,
            (true, _) => BlockStatus::Completed,
            (false, Some(_)) => BlockStatus::Completed,
            (false, None) => BlockStatus::Cancelled,
        }
    }
}

/// Terminal-emulation collaborator used only during a hand-off.
pub trait TerminalEmulator: Send {
    /// Start rendering `command`. Failing here aborts the hand-off before
    /// anything is written to the connection.
    fn begin(&mut self, command: &str, cols: u16, rows: u16, input: InputSink) -> anyhow::Result<()>;

    /// Raw connection output, unmodified.
    fn feed(&mut self, bytes: &[u8]);

    fn resize(&mut self, cols: u16, rows: u16);

    fn end(&mut self, exit: &FullscreenExit);

    /// Visible screen contents, if the emulator keeps any.
    fn snapshot_text(&self) -> Option<String> {
        None
    }
}

/// State of one running hand-off.
#[derive(Debug)]
pub struct FullscreenHandoff {
    pub session: Uuid,
    pub block: BlockId,
    pub command: String,
    pub started_at: DateTime<Utc>,
    processor: OutputProcessor,
}

impl FullscreenHandoff {
    pub fn modes(&self) -> ModeSnapshot {
        self.processor.modes()
    }
}

/// Output seen while a hand-off is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThrough {
    pub bytes: Vec<u8>,
    pub markers: Vec<OscEvent>,
}

/// A finished hand-off, ready to be turned into a summary block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    pub block: BlockId,
    pub command: String,
    pub exit: FullscreenExit,
    pub summary: String,
}

pub struct HandoffController {
    emulator: Box<dyn TerminalEmulator>,
    active: Option<FullscreenHandoff>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    input_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl std::fmt::Debug for HandoffController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffController")
            .field("emulator", &"Box<dyn TerminalEmulator>")
            .field("active", &self.active)
            .finish()
    }
}

impl HandoffController {
    pub fn new(emulator: Box<dyn TerminalEmulator>) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            emulator,
            active: None,
            input_tx,
            input_rx: Some(input_rx),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&FullscreenHandoff> {
        self.active.as_ref()
    }

    pub fn emulator(&self) -> &dyn TerminalEmulator {
        self.emulator.as_ref()
    }

    /// Receiver for emulator-originated input. Can be taken once, by
    /// whoever pumps it into the connection.
    pub fn take_input_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.input_rx.take()
    }

    /// Drain emulator input without blocking (when nobody took the receiver).
    pub fn drain_input(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(rx) = self.input_rx.as_mut() {
            while let Ok(bytes) = rx.try_recv() {
                out.push(bytes);
            }
        }
        out
    }

    pub fn begin(
        &mut self,
        session: Uuid,
        block: BlockId,
        command: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::BlockInFlight);
        }

        let sink = InputSink::new(self.input_tx.clone());
        self.emulator
            .begin(command, cols, rows, sink)
            .map_err(|e| SessionError::HandoffUnavailable(format!("{e:#}")))?;

        info!(session = %session, block = %block, command, "Fullscreen hand-off started");
        self.active = Some(FullscreenHandoff {
            session,
            block,
            command: command.to_string(),
            started_at: Utc::now(),
            processor: OutputProcessor::fullscreen(),
        });
        Ok(())
    }

    /// Route connection output to the emulator. `None` if no hand-off is
    /// running.
    pub fn ingest(&mut self, bytes: &[u8], hint: EncodingHint) -> Option<PassThrough> {
        let handoff = self.active.as_mut()?;

        let Processed::Raw { bytes, markers, mode_changes } = handoff.processor.process(bytes, hint) else {
            return None;
        };
        for change in mode_changes {
            match change {
                ModeChange::AltScreenEntered => debug!(block = %handoff.block, "Entered alternate screen"),
                ModeChange::AltScreenLeft => debug!(block = %handoff.block, "Left alternate screen"),
            }
        }

        self.emulator.feed(&bytes);
        Some(PassThrough { bytes, markers })
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        if self.active.is_some() {
            self.emulator.resize(cols, rows);
        }
    }

    pub fn finish(&mut self, exit: FullscreenExit) -> Option<HandoffReport> {
        let handoff = self.active.take()?;
        self.emulator.end(&exit);

        let elapsed = Utc::now() - handoff.started_at;
        info!(
            block = %handoff.block,
            command = %handoff.command,
            exit_code = ?exit.exit_code,
            graceful = exit.graceful,
            elapsed_ms = elapsed.num_milliseconds(),
            "Fullscreen hand-off ended"
        );

        Some(HandoffReport {
            block: handoff.block,
            summary: summarize(&handoff.command, &exit),
            command: handoff.command,
            exit,
        })
    }
}

/// One-line, human-readable account of a fullscreen run.
pub fn summarize(command: &str, exit: &FullscreenExit) -> String {
    match (exit.graceful, exit.exit_code) {
        (true, Some(code)) => format!("{command} exited with code {code}"),
        (true, None) => format!("{command} exited"),
        (false, Some(code)) => format!("{command} was terminated (code {code})"),
        (false, None) => format!("{command} was closed"),
    }
}
