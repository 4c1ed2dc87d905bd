//! Session: one connection, its ordered blocks, and the single output stream.
//!
//! Everything in here is synchronous and single-writer. The async driver
//! ([`crate::engine::SessionEngine`]) serializes input and connection
//! events through one lock, so block and focus mutations never interleave.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::blocks::{Block, BlockId, BlockSnapshot, BlockStatus};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionEvent, SessionKind};
use crate::error::SessionError;
use crate::focus::{FocusArbiter, InputRoute};
use crate::handoff::{FullscreenExit, FullscreenHandoff, HandoffController, TerminalEmulator};
use crate::runtime::{Classification, Classifier, CommandProfile};
use crate::state_machine::HeadlessEmulator;
use crate::term::{EncodingHint, Fragment, OscEvent, OscScanner, SemanticEvent, SemanticState};

/// Cached classifications kept before the cache is reset.
const PROFILE_CACHE_LIMIT: usize = 512;

/// Which part of a block changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockField {
    Status,
    Output,
    ExitCode,
    Focus,
}

/// Change notifications for renderers and other subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    BlockAdded(BlockId),
    BlockChanged { id: BlockId, field: BlockField },
    FocusChanged(Option<BlockId>),
    FullscreenStarted { block: BlockId, command: String },
    /// Raw bytes for the fullscreen view.
    FullscreenOutput(Vec<u8>),
    FullscreenEnded { block: BlockId, exit_code: Option<i32>, graceful: bool },
    Cleared,
    Bell,
    CwdChanged(String),
    ConnectionError(String),
    Closed,
}

/// A user input event, before arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// A full line (Enter pressed).
    Line(String),
    /// Keystrokes as bytes.
    Raw(Vec<u8>),
}

pub struct Session {
    id: Uuid,
    kind: SessionKind,
    config: SessionConfig,
    encoding: EncodingHint,
    cols: u16,
    rows: u16,

    connection: Option<Box<dyn Connection>>,
    closed: bool,

    classifier: Arc<Classifier>,
    profiles: HashMap<String, CommandProfile>,

    focus: FocusArbiter,
    blocks: Vec<Block>,
    next_index: u64,
    // The block currently receiving output.
    active: Option<BlockId>,

    handoff: HandoffController,

    semantic: SemanticState,
    // Watches output that belongs to no block.
    idle_scanner: OscScanner,
    // After a cancel, output up to the next prompt belongs to nobody.
    draining: bool,
    // A prompt-start marker is due that belongs to no block (the one after
    // a command-finished marker, or the shell's first prompt).
    prompt_due: bool,
    // The shell has shown its first prompt. Hooks may print a
    // command-finished marker ahead of it that belongs to no command.
    shell_ready: bool,
    prompt: Option<Regex>,

    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.closed)
            .field("blocks", &self.blocks.len())
            .field("active", &self.active)
            .field("focused", &self.focus.focused())
            .field("handoff", &self.handoff.active().map(|h| h.block))
            .finish()
    }
}

/// Shell prompts such as `$ `, `user@host:~$ `, `[me@host dir]# ` or
/// `(venv) user@host:~% `, for shells without markers or a configured pattern.
fn shell_prompt() -> Option<&'static Regex> {
    static SHELL_PROMPT: OnceLock<Option<Regex>> = OnceLock::new();
    SHELL_PROMPT
        .get_or_init(|| Regex::new(r"^(\([^)]*\) )?(\[[^\]]*\]|\S*[@:]\S*)?[$#%] ?$").ok())
        .as_ref()
}

fn repl_prompt() -> Option<&'static Regex> {
    static REPL_PROMPT: OnceLock<Option<Regex>> = OnceLock::new();
    REPL_PROMPT
        .get_or_init(|| Regex::new(r"(>>>|\.\.\.|=>|[\w\-]*[>#?]) ?$").ok())
        .as_ref()
}

/// Bytes for "type this line and press Enter".
fn line_bytes(line: &str) -> Vec<u8> {
    let s = line.trim_end_matches(['\r', '\n']);
    let mut out = s.as_bytes().to_vec();
    if cfg!(windows) {
        // ConPTY wants CRLF
        out.extend_from_slice(b"\r\n");
    } else {
        out.push(b'\n');
    }
    out
}

fn status_for_exit(exit_code: Option<i32>) -> BlockStatus {
    match exit_code {
        None | Some(0) => BlockStatus::Completed,
        Some(_) => BlockStatus::Failed,
    }
}

impl Session {
    pub fn new(config: SessionConfig, connection: Box<dyn Connection>) -> Self {
        let classifier = Arc::new(Classifier::with_overrides(&config.classifier));
        let emulator = HeadlessEmulator::new(config.cols, config.rows);

        let prompt = config.prompt_pattern.as_deref().and_then(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, error = %e, "Ignoring invalid prompt pattern");
                None
            }
        });

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let id = Uuid::new_v4();
        let kind = connection.kind();
        info!(session = %id, kind = ?kind, "Session opened");

        Self {
            id,
            kind,
            encoding: EncodingHint::from_label(&config.encoding),
            cols: config.cols,
            rows: config.rows,
            config,
            connection: Some(connection),
            closed: false,
            classifier,
            profiles: HashMap::new(),
            focus: FocusArbiter::new(),
            blocks: Vec::new(),
            next_index: 0,
            active: None,
            handoff: HandoffController::new(Box::new(emulator)),
            semantic: SemanticState::new(),
            idle_scanner: OscScanner::new(),
            draining: false,
            prompt_due: true,
            shell_ready: false,
            prompt,
            events,
        }
    }

    /// Share a classifier between sessions.
    pub fn with_classifier(mut self, classifier: Arc<Classifier>) -> Self {
        self.classifier = classifier;
        self.profiles.clear();
        self
    }

    pub fn with_emulator(mut self, emulator: Box<dyn TerminalEmulator>) -> Self {
        self.handoff = HandoffController::new(emulator);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.index_of(id).map(|idx| &self.blocks[idx])
    }

    pub fn focused(&self) -> Option<BlockId> {
        self.focus.focused()
    }

    pub fn active_block(&self) -> Option<BlockId> {
        self.active
    }

    pub fn route(&self) -> InputRoute {
        self.focus.route(&self.blocks)
    }

    pub fn handoff(&self) -> Option<&FullscreenHandoff> {
        self.handoff.active()
    }

    /// Text the fullscreen emulator currently shows.
    pub fn fullscreen_text(&self) -> Option<String> {
        self.handoff.emulator().snapshot_text()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.semantic.cwd.as_deref()
    }

    pub fn snapshot(&self) -> Vec<BlockSnapshot> {
        self.blocks.iter().map(Block::snapshot).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn take_input_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.handoff.take_input_receiver()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn submit(&mut self, command: &str) -> Result<BlockId, SessionError> {
        self.ensure_open()?;
        if self.handoff.is_active() {
            return Err(SessionError::BlockInFlight);
        }
        if let Some(live) = self.blocks.iter().find(|b| !b.is_terminal()) {
            debug!(block = %live.id, command, "Submission rejected, block in flight");
            return Err(SessionError::BlockInFlight);
        }

        let profile = self.classify(command);
        let connected = self.connection.as_ref().is_some_and(|c| c.is_open());
        if !connected && !profile.fullscreen_required {
            return Err(SessionError::SessionClosed);
        }

        let id = self.next_id();
        let block = Block::new(id, command, &profile).with_cwd(self.semantic.cwd.clone());
        debug!(
            block = %id,
            command,
            classification = ?profile.classification,
            fullscreen = profile.fullscreen_required,
            "Block created"
        );
        self.blocks.push(block);
        self.emit(SessionEvent::BlockAdded(id));

        if profile.fullscreen_required {
            self.start_fullscreen(id, command);
            return Ok(id);
        }

        if let Err(e) = self.write(&line_bytes(command)) {
            warn!(block = %id, error = %e, "Failed to write command");
            self.finish_block(id, BlockStatus::Failed, None);
            self.emit(SessionEvent::ConnectionError(format!("{e:#}")));
            return Ok(id);
        }

        let idx = self.blocks.len() - 1;
        if let Err(e) = self.blocks[idx].start() {
            warn!(block = %id, error = %e, "Block did not start");
            return Ok(id);
        }
        self.active = Some(id);
        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });

        if self.focus.on_block_started(&self.blocks[idx]) {
            self.emit_focus(None, Some(id));
        }
        Ok(id)
    }

    /// Keystrokes for the focused block (or the fullscreen program).
    pub fn send_raw_input(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.ensure_open()?;

        if self.handoff.is_active() {
            return self.write_or_fail(bytes);
        }

        let InputRoute::Focused(id) = self.focus.route(&self.blocks) else {
            return Err(SessionError::NoFocusTarget);
        };
        self.write_or_fail(bytes)?;

        if let Some(idx) = self.index_of(id) {
            if self.blocks[idx].status() == BlockStatus::Running && self.blocks[idx].mark_interactive().is_ok() {
                self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });
            }
        }
        Ok(())
    }

    /// Arbitrate one input event. Returns the new block, if one was created.
    pub fn handle_input(&mut self, input: InputEvent) -> Result<Option<BlockId>, SessionError> {
        match input {
            InputEvent::Raw(bytes) => self.send_raw_input(&bytes).map(|_| None),
            InputEvent::Line(line) => match self.focus.route(&self.blocks) {
                InputRoute::Fullscreen | InputRoute::Focused(_) => {
                    self.send_raw_input(&line_bytes(&line)).map(|_| None)
                }
                InputRoute::NewCommand => self.submit(&line).map(Some),
                InputRoute::Blocked(_) => Err(SessionError::BlockInFlight),
            },
        }
    }

    /// Interrupt and cancel the focused block. During a hand-off this ends
    /// the fullscreen program's session instead.
    pub fn cancel_focused(&mut self) -> Result<BlockId, SessionError> {
        self.ensure_open()?;

        if let Some(block) = self.handoff.active().map(|h| h.block) {
            self.close_fullscreen()?;
            return Ok(block);
        }

        let id = self.focus.focused().ok_or(SessionError::NoFocusTarget)?;
        self.cancel(id)?;
        Ok(id)
    }

    /// Cancel a specific block. Cancelling a finished block changes nothing
    /// and returns `Ok(false)`.
    pub fn cancel(&mut self, id: BlockId) -> Result<bool, SessionError> {
        let idx = self.index_of(id).ok_or(SessionError::UnknownBlock(id))?;
        if self.blocks[idx].is_terminal() {
            return Ok(false);
        }
        if self.handoff.active().is_some_and(|h| h.block == id) {
            self.close_fullscreen()?;
            return Ok(true);
        }

        self.interrupt();
        if !self.blocks[idx].cancel() {
            return Ok(false);
        }
        debug!(block = %id, "Block cancelled");
        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });

        if self.active == Some(id) {
            self.active = None;
            // whatever the program still prints belongs to nobody
            if self.semantic.integrated {
                self.draining = true;
                self.prompt_due = false;
            }
        }
        self.release_focus_if_needed(idx);
        Ok(true)
    }

    pub fn request_focus(&mut self, id: BlockId) -> Result<(), SessionError> {
        self.ensure_open()?;
        let previous = self.focus.request(id, &self.blocks)?;
        if previous != Some(id) {
            self.emit_focus(previous, Some(id));
        }
        Ok(())
    }

    pub fn clear_focus(&mut self) -> Option<BlockId> {
        let previous = self.focus.clear();
        if previous.is_some() {
            self.emit_focus(previous, None);
        }
        previous
    }

    /// No-op once the session is closed.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        if !conn.is_open() {
            return Ok(());
        }

        conn.resize(cols, rows)?;
        self.cols = cols;
        self.rows = rows;
        self.handoff.resize(cols, rows);
        debug!(session = %self.id, cols, rows, "Resized");
        Ok(())
    }

    /// Drop every block and start over on the same connection.
    pub fn clear_all(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.handoff.is_active() {
            return Err(SessionError::BlockInFlight);
        }

        let live: Vec<BlockId> = self.blocks.iter().filter(|b| !b.is_terminal()).map(|b| b.id).collect();
        for id in live {
            self.cancel(id)?;
        }

        self.focus.clear();
        self.active = None;
        let dropped = self.blocks.len();
        self.blocks.clear();
        self.profiles.clear();
        info!(session = %self.id, dropped, "Session cleared");
        self.emit(SessionEvent::Cleared);
        Ok(())
    }

    /// Close the connection, cancel whatever is still live and hand the
    /// blocks back to the caller.
    pub fn close(&mut self) -> Vec<Block> {
        self.terminate("closed by user");
        std::mem::take(&mut self.blocks)
    }

    /// User closed the fullscreen view before the program exited.
    pub fn close_fullscreen(&mut self) -> Result<Option<BlockId>, SessionError> {
        if !self.handoff.is_active() {
            return Ok(None);
        }
        self.interrupt();
        let summary = self.finish_fullscreen(FullscreenExit::aborted(None));
        if self.semantic.integrated {
            self.draining = true;
            self.prompt_due = false;
        }
        Ok(summary)
    }

    /// The fullscreen program reported its exit. Returns the summary block.
    pub fn finish_fullscreen(&mut self, exit: FullscreenExit) -> Option<BlockId> {
        self.finish_fullscreen_as(exit, exit.final_status())
    }

    /// Forward emulator-originated bytes (query replies) to the connection.
    pub fn write_fullscreen_input(&mut self, bytes: &[u8]) {
        if !self.handoff.is_active() || self.closed {
            trace!(len = bytes.len(), "Dropped emulator input outside hand-off");
            return;
        }
        if let Err(e) = self.write_or_fail(bytes) {
            warn!(error = %e, "Failed to forward emulator input");
        }
    }

    /// Drain emulator input when nobody took the receiver.
    pub fn pump_fullscreen_input(&mut self) {
        for bytes in self.handoff.drain_input() {
            self.write_fullscreen_input(&bytes);
        }
    }

    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if self.closed {
            trace!(event = ?event, "Event after close ignored");
            return;
        }

        match event {
            ConnectionEvent::Output(bytes) => self.route_output(&bytes),
            ConnectionEvent::Exited { code } => {
                info!(session = %self.id, code = ?code, "Connection exited");
                if self.handoff.is_active() {
                    self.finish_fullscreen(FullscreenExit::exited(code));
                }
                if let Some(id) = self.active {
                    self.finish_block(id, status_for_exit(code), code);
                }
                self.terminate("connection exited");
            }
            ConnectionEvent::Error(message) => self.connection_failed(&message),
        }
    }

    /// The event stream ended without an exit report.
    pub fn connection_lost(&mut self) {
        if self.closed {
            return;
        }
        self.connection_failed("connection event stream ended");
        self.terminate("connection lost");
    }

    // ========================================================================
    // Output routing
    // ========================================================================

    fn route_output(&mut self, bytes: &[u8]) {
        let mut rest = bytes;

        if self.draining {
            let mut cut = None;
            for (pos, ev) in self.idle_scanner.feed_positions(bytes) {
                self.apply_semantic(&ev);
                if ev == OscEvent::PromptStart {
                    cut = Some(pos);
                    break;
                }
            }
            let Some(pos) = cut else {
                trace!(len = bytes.len(), "Discarded output after cancel");
                return;
            };
            debug!(session = %self.id, "Cancelled command drained");
            self.draining = false;
            rest = &bytes[pos..];
        }

        if self.handoff.is_active() {
            self.route_fullscreen(rest);
            return;
        }

        match self.active {
            Some(id) => self.feed_block(id, rest),
            None => {
                for ev in self.idle_scanner.feed(rest) {
                    self.on_unowned_marker(&ev);
                }
            }
        }
    }

    fn route_fullscreen(&mut self, bytes: &[u8]) {
        let Some(pass) = self.handoff.ingest(bytes, self.encoding) else {
            return;
        };
        if !pass.bytes.is_empty() {
            self.emit(SessionEvent::FullscreenOutput(pass.bytes));
        }

        for marker in pass.markers {
            if !self.handoff.is_active() {
                self.on_unowned_marker(&marker);
                continue;
            }
            self.apply_semantic(&marker);
            match marker {
                OscEvent::CommandFinished { .. } if !self.shell_ready => {
                    trace!(session = %self.id, "Command-finished marker before the first prompt ignored");
                }
                OscEvent::CommandFinished { exit_code } => {
                    self.prompt_due = true;
                    self.finish_fullscreen(FullscreenExit::exited(exit_code));
                }
                OscEvent::PromptStart if self.prompt_due => {
                    self.prompt_due = false;
                    self.shell_ready = true;
                }
                OscEvent::PromptStart => {
                    self.finish_fullscreen(FullscreenExit::exited(None));
                }
                _ => {}
            }
        }
    }

    fn feed_block(&mut self, id: BlockId, bytes: &[u8]) {
        let Some(idx) = self.index_of(id) else {
            self.active = None;
            return;
        };

        let fragments = match self.blocks[idx].process(bytes, self.encoding) {
            Ok(fragments) => fragments,
            Err(e) => {
                trace!(block = %id, error = %e, "Output for finished block discarded");
                self.active = None;
                return;
            }
        };

        let mut changed = false;
        for fragment in fragments {
            if self.active != Some(id) {
                // the block ended earlier in this chunk
                if let Fragment::Marker(marker) = fragment {
                    self.on_unowned_marker(&marker);
                }
                continue;
            }

            match fragment {
                Fragment::Text(text) => {
                    changed |= self.blocks[idx].append_text(&text).unwrap_or(false);
                }
                Fragment::Bell => self.emit(SessionEvent::Bell),
                Fragment::Marker(marker) => {
                    if std::mem::take(&mut changed) {
                        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Output });
                    }
                    self.apply_semantic(&marker);
                    match marker {
                        OscEvent::CommandFinished { .. } if !self.shell_ready => {
                            trace!(block = %id, "Command-finished marker before the first prompt ignored");
                        }
                        OscEvent::CommandFinished { exit_code } => {
                            self.prompt_due = true;
                            self.finish_block(id, status_for_exit(exit_code), exit_code);
                        }
                        OscEvent::PromptStart if self.prompt_due => {
                            self.prompt_due = false;
                            if !std::mem::replace(&mut self.shell_ready, true)
                                && self.blocks[idx].restart_output()
                            {
                                // startup output ahead of the first prompt
                                self.emit(SessionEvent::BlockChanged { id, field: BlockField::Output });
                            }
                        }
                        OscEvent::PromptStart => {
                            self.finish_block(id, BlockStatus::Completed, None);
                        }
                        _ => {}
                    }
                }
            }
        }

        if !changed {
            return;
        }
        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Output });
        self.detect_prompt(idx);
    }

    // Prompt heuristics for output without shell-integration markers.
    fn detect_prompt(&mut self, idx: usize) {
        let block = &self.blocks[idx];
        let id = block.id;
        let trailing = block.trailing_line();
        if trailing.is_empty() {
            return;
        }

        if !self.semantic.integrated {
            let matched = match self.prompt.as_ref() {
                Some(re) => Some(re.is_match(&trailing)),
                None => shell_prompt().map(|re| re.is_match(&trailing)),
            };
            if let Some(is_match) = matched {
                if is_match {
                    debug!(block = %id, "Shell prompt detected");
                    self.blocks[idx].drop_trailing_line();
                    self.finish_block(id, BlockStatus::Completed, None);
                    return;
                }
            }
        }

        let block = &mut self.blocks[idx];
        if block.classification == Classification::Interactive
            && block.status() == BlockStatus::Running
            && repl_prompt().is_some_and(|re| re.is_match(&trailing))
            && block.mark_interactive().is_ok()
        {
            self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });
        }
    }

    fn on_unowned_marker(&mut self, marker: &OscEvent) {
        self.apply_semantic(marker);
        if *marker == OscEvent::PromptStart {
            self.prompt_due = false;
            self.shell_ready = true;
        }
    }

    fn apply_semantic(&mut self, marker: &OscEvent) {
        if let Some(SemanticEvent::CwdChanged(cwd)) = self.semantic.apply(marker) {
            debug!(session = %self.id, cwd = %cwd, "Working directory changed");
            self.emit(SessionEvent::CwdChanged(cwd));
        }
    }

    // ========================================================================
    // Fullscreen hand-off
    // ========================================================================

    fn start_fullscreen(&mut self, id: BlockId, command: &str) {
        if !self.connection.as_ref().is_some_and(|c| c.is_open()) {
            self.handoff_failed(id, "connection is not open");
            return;
        }

        if let Err(e) = self.handoff.begin(self.id, id, command, self.cols, self.rows) {
            self.handoff_failed(id, &e.to_string());
            return;
        }

        if let Err(e) = self.write(&line_bytes(command)) {
            self.handoff.finish(FullscreenExit::aborted(None));
            self.handoff_failed(id, &format!("{e:#}"));
            self.emit(SessionEvent::ConnectionError(format!("{e:#}")));
            return;
        }

        if let Some(idx) = self.index_of(id) {
            if let Err(e) = self.blocks[idx].start() {
                warn!(block = %id, error = %e, "Fullscreen block did not start");
            }
        }
        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });

        if let Some(previous) = self.focus.suspend() {
            self.emit_focus(Some(previous), None);
        }
        self.emit(SessionEvent::FullscreenStarted { block: id, command: command.to_string() });
    }

    fn handoff_failed(&mut self, id: BlockId, reason: &str) {
        warn!(block = %id, reason, "Fullscreen hand-off failed");
        self.finish_block(id, BlockStatus::Failed, None);
    }

    fn finish_fullscreen_as(&mut self, exit: FullscreenExit, status: BlockStatus) -> Option<BlockId> {
        let report = self.handoff.finish(exit)?;
        self.finish_block(report.block, status, exit.exit_code);

        let id = self.next_id();
        let mut summary = Block::fullscreen_summary(id, report.command, report.summary)
            .with_cwd(self.semantic.cwd.clone());
        if let Err(e) = summary.start().and_then(|_| summary.finish(status, exit.exit_code)) {
            warn!(block = %id, error = %e, "Summary block transition rejected");
        }
        self.blocks.push(summary);
        self.emit(SessionEvent::BlockAdded(id));

        self.focus.resume();
        self.emit(SessionEvent::FullscreenEnded {
            block: report.block,
            exit_code: exit.exit_code,
            graceful: exit.graceful,
        });
        Some(id)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed || self.connection.is_none() {
            return Err(SessionError::SessionClosed);
        }
        Ok(())
    }

    fn classify(&mut self, command: &str) -> CommandProfile {
        if self.profiles.len() >= PROFILE_CACHE_LIMIT {
            self.profiles.clear();
        }
        self.profiles
            .entry(command.to_string())
            .or_insert_with(|| self.classifier.classify(command))
            .clone()
    }

    fn next_id(&mut self) -> BlockId {
        let id = BlockId(self.next_index);
        self.next_index += 1;
        id
    }

    fn index_of(&self, id: BlockId) -> Option<usize> {
        self.blocks.binary_search_by_key(&id, |b| b.id).ok()
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_focus(&self, previous: Option<BlockId>, current: Option<BlockId>) {
        if let Some(prev) = previous {
            self.emit(SessionEvent::BlockChanged { id: prev, field: BlockField::Focus });
        }
        if let Some(cur) = current {
            self.emit(SessionEvent::BlockChanged { id: cur, field: BlockField::Focus });
        }
        self.emit(SessionEvent::FocusChanged(current));
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("connection is closed"))?;
        conn.write(data)
    }

    fn write_or_fail(&mut self, data: &[u8]) -> Result<(), SessionError> {
        match self.write(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connection_failed(&format!("{e:#}"));
                Err(SessionError::Connection(e))
            }
        }
    }

    fn interrupt(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = conn.interrupt() {
            warn!(session = %self.id, error = %e, "Interrupt failed");
        }
    }

    fn finish_block(&mut self, id: BlockId, status: BlockStatus, exit_code: Option<i32>) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        if let Err(e) = self.blocks[idx].finish(status, exit_code) {
            debug!(block = %id, error = %e, "Ignored status change");
            return false;
        }

        if self.active == Some(id) {
            self.active = None;
        }
        self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });
        if exit_code.is_some() {
            self.emit(SessionEvent::BlockChanged { id, field: BlockField::ExitCode });
        }
        self.release_focus_if_needed(idx);
        true
    }

    fn release_focus_if_needed(&mut self, idx: usize) {
        if self.focus.on_block_changed(&self.blocks[idx]) {
            self.emit_focus(Some(self.blocks[idx].id), None);
        }
    }

    fn connection_failed(&mut self, message: &str) {
        warn!(session = %self.id, error = message, "Connection error");
        if self.handoff.is_active() {
            self.finish_fullscreen_as(FullscreenExit::aborted(None), BlockStatus::Failed);
        }
        if let Some(id) = self.active {
            self.finish_block(id, BlockStatus::Failed, None);
        }
        self.emit(SessionEvent::ConnectionError(message.to_string()));

        if !self.connection.as_ref().is_some_and(|c| c.is_open()) {
            self.terminate("connection lost");
        }
    }

    fn terminate(&mut self, reason: &str) {
        if self.closed {
            return;
        }

        if self.handoff.is_active() {
            self.finish_fullscreen(FullscreenExit::aborted(None));
        }

        let live: Vec<usize> = (0..self.blocks.len()).filter(|&i| !self.blocks[i].is_terminal()).collect();
        for idx in live {
            if self.blocks[idx].cancel() {
                let id = self.blocks[idx].id;
                self.emit(SessionEvent::BlockChanged { id, field: BlockField::Status });
            }
        }

        if let Some(mut conn) = self.connection.take() {
            if conn.is_open() {
                if let Err(e) = conn.close() {
                    warn!(session = %self.id, error = %e, "Failed to close connection");
                }
            }
        }

        self.closed = true;
        self.active = None;
        self.draining = false;
        if let Some(previous) = self.focus.clear() {
            self.emit_focus(Some(previous), None);
        }
        info!(session = %self.id, reason, "Session closed");
        self.emit(SessionEvent::Closed);
    }
}
