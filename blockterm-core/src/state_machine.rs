use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::Line;
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi::Processor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::handoff::{FullscreenExit, InputSink, TerminalEmulator};

/// Headless terminal for fullscreen programs.
/// It parses ANSI escape codes and maintains the grid state (what char is where),
/// so a renderer can draw the screen and the session can summarize it.
pub struct HeadlessEmulator {
    // Shared with whoever renders the grid.
    term: Mutex<Term<EventProxy>>,
    parser: Processor,
    sink: Arc<Mutex<Option<InputSink>>>,
    command: Option<String>,
}

impl std::fmt::Debug for HeadlessEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessEmulator")
            .field("term", &"Term<EventProxy>")
            .field("command", &self.command)
            .finish()
    }
}

impl HeadlessEmulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        let sink = Arc::new(Mutex::new(None));
        let proxy = EventProxy { sink: sink.clone() };
        let term = Term::new(Config::default(), &TermSize::new(cols, rows), proxy);

        Self {
            term: Mutex::new(term),
            parser: Processor::new(),
            sink,
            command: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Term<EventProxy>> {
        self.term.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Visible rows, right-trimmed, joined by newlines.
    pub fn screen_text(&self) -> String {
        let term = self.lock();
        let grid = term.grid();

        let mut lines = Vec::with_capacity(grid.screen_lines());
        for y in 0..grid.screen_lines() {
            let Ok(idx) = i32::try_from(y) else { break };
            let row = &grid[Line(idx)];
            let text: String = row.into_iter().map(|cell| cell.c).collect();
            lines.push(text.trim_end().to_string());
        }

        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    pub fn alt_screen(&self) -> bool {
        self.lock().mode().contains(TermMode::ALT_SCREEN)
    }
}

impl TerminalEmulator for HeadlessEmulator {
    fn begin(&mut self, command: &str, cols: u16, rows: u16, input: InputSink) -> anyhow::Result<()> {
        {
            let mut term = self.lock();
            *term = Term::new(
                Config::default(),
                &TermSize::new(cols, rows),
                EventProxy { sink: self.sink.clone() },
            );
        }
        self.parser = Processor::new();
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(input);
        self.command = Some(command.to_string());
        debug!(command, cols, rows, "Headless emulator attached");
        Ok(())
    }

    fn feed(&mut self, bytes: &[u8]) {
        let mut term = self.term.lock().unwrap_or_else(PoisonError::into_inner);
        self.parser.advance(&mut *term, bytes);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.lock().resize(TermSize::new(cols, rows));
    }

    fn end(&mut self, exit: &FullscreenExit) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(command = ?self.command.take(), exit_code = ?exit.exit_code, "Headless emulator detached");
    }

    fn snapshot_text(&self) -> Option<String> {
        Some(self.screen_text())
    }
}

// --- Helper Types ---

/// Terminal size for creating/resizing the Term.
#[derive(Debug, Clone, Copy)]
struct TermSize {
    cols: usize,
    rows: usize,
}

impl TermSize {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: usize::from(cols.max(1)),
            rows: usize::from(rows.max(1)),
        }
    }
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// Forwards the terminal's replies (device attributes, cursor reports) to
/// the connection while a hand-off is running.
#[derive(Clone)]
pub struct EventProxy {
    sink: Arc<Mutex<Option<InputSink>>>,
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        match event {
            Event::PtyWrite(text) => {
                let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(sink) = sink.as_ref() {
                    sink.send(text.into_bytes());
                }
            }
            other => trace!(event = ?other, "Ignored terminal event"),
        }
    }
}
