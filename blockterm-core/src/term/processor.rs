//! Output processor: bytes from the connection -> renderable block text.
//!
//! Decoding and control-sequence parsing are both stateful, so a sequence
//! split across two reads is completed on the next call instead of turning
//! into garbage. One processor per output stream.
//!
//! Block mode keeps SGR (colour/style) sequences inline and drops everything
//! that assumes a movable cursor. Fullscreen mode leaves the bytes alone and
//! only watches them for shell markers and mode switches.

use alacritty_terminal::vte::{Params, Parser, Perform};
use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use tracing::{trace, warn};

use super::modes::{ModeChange, ModeSnapshot, ModeTracker};
use super::osc::{parse_osc_params, OscEvent, OscScanner};

/// Character encoding of a connection's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingHint(&'static Encoding);

impl EncodingHint {
    pub fn utf8() -> Self {
        Self(UTF_8)
    }

    /// Resolve a WHATWG label (`"utf-8"`, `"latin1"`, `"shift_jis"`...).
    /// Unknown labels fall back to UTF-8.
    pub fn from_label(label: &str) -> Self {
        match Encoding::for_label(label.trim().as_bytes()) {
            Some(encoding) => Self(encoding),
            None => {
                warn!(label, "Unknown output encoding, using UTF-8");
                Self::utf8()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    fn encoding(&self) -> &'static Encoding {
        self.0
    }
}

impl Default for EncodingHint {
    fn default() -> Self {
        Self::utf8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    Block,
    Fullscreen,
}

/// A piece of block-mode output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Printable text, possibly carrying SGR sequences.
    Text(String),
    /// A shell-integration marker (OSC 133 / OSC 7).
    Marker(OscEvent),
    Bell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Block(Vec<Fragment>),
    Raw {
        bytes: Vec<u8>,
        markers: Vec<OscEvent>,
        mode_changes: Vec<ModeChange>,
    },
}

impl Processed {
    /// Concatenated text of a block-mode result; raw output is decoded lossily.
    pub fn text(&self) -> String {
        match self {
            Processed::Block(fragments) => fragments
                .iter()
                .filter_map(|f| match f {
                    Fragment::Text(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect(),
            Processed::Raw { bytes, .. } => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn markers(&self) -> Vec<OscEvent> {
        match self {
            Processed::Block(fragments) => fragments
                .iter()
                .filter_map(|f| match f {
                    Fragment::Marker(m) => Some(m.clone()),
                    _ => None,
                })
                .collect(),
            Processed::Raw { markers, .. } => markers.clone(),
        }
    }
}

pub struct OutputProcessor {
    mode: ProcessorMode,
    hint: EncodingHint,
    decoder: Decoder,
    parser: Parser,
    filter: BlockFilter,
    osc: OscScanner,
    modes: ModeTracker,
}

impl std::fmt::Debug for OutputProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputProcessor")
            .field("mode", &self.mode)
            .field("encoding", &self.hint.name())
            .field("modes", &self.modes.snapshot())
            .finish()
    }
}

impl OutputProcessor {
    pub fn new(mode: ProcessorMode) -> Self {
        let hint = EncodingHint::utf8();
        Self {
            mode,
            hint,
            decoder: hint.encoding().new_decoder_without_bom_handling(),
            parser: Parser::new(),
            filter: BlockFilter::default(),
            osc: OscScanner::new(),
            modes: ModeTracker::new(),
        }
    }

    pub fn block() -> Self {
        Self::new(ProcessorMode::Block)
    }

    pub fn fullscreen() -> Self {
        Self::new(ProcessorMode::Fullscreen)
    }

    pub fn mode(&self) -> ProcessorMode {
        self.mode
    }

    pub fn modes(&self) -> ModeSnapshot {
        self.modes.snapshot()
    }

    pub fn process(&mut self, bytes: &[u8], hint: EncodingHint) -> Processed {
        match self.mode {
            ProcessorMode::Block => {
                self.ensure_encoding(hint);
                let text = self.decode(bytes, false);
                Processed::Block(self.filter_text(&text))
            }
            ProcessorMode::Fullscreen => Processed::Raw {
                bytes: bytes.to_vec(),
                markers: self.osc.feed(bytes),
                mode_changes: self.modes.feed(bytes),
            },
        }
    }

    /// End of stream: an incomplete multi-byte sequence still buffered
    /// becomes a replacement character.
    pub fn finish(&mut self) -> Vec<Fragment> {
        if self.mode == ProcessorMode::Fullscreen {
            return Vec::new();
        }
        let text = self.decode(&[], true);
        self.decoder = self.hint.encoding().new_decoder_without_bom_handling();
        self.filter_text(&text)
    }

    fn ensure_encoding(&mut self, hint: EncodingHint) {
        if hint != self.hint {
            trace!(from = self.hint.name(), to = hint.name(), "Switching output encoding");
            self.hint = hint;
            self.decoder = hint.encoding().new_decoder_without_bom_handling();
        }
    }

    fn decode(&mut self, src: &[u8], last: bool) -> String {
        let mut out = String::with_capacity(
            self.decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len() * 3 + 16),
        );
        let mut consumed = 0;

        loop {
            let (result, read, replaced) =
                self.decoder.decode_to_string(&src[consumed..], &mut out, last);
            consumed += read;
            if replaced {
                trace!(encoding = self.hint.name(), "Malformed output bytes replaced");
            }
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => {
                    let extra = self
                        .decoder
                        .max_utf8_buffer_length(src.len() - consumed)
                        .unwrap_or(64);
                    out.reserve(extra.max(16));
                }
            }
        }

        out
    }

    fn filter_text(&mut self, text: &str) -> Vec<Fragment> {
        self.parser.advance(&mut self.filter, text.as_bytes());
        self.filter.take()
    }
}

/// vte performer that keeps text and SGR, and drops the rest.
#[derive(Debug, Default)]
struct BlockFilter {
    text: String,
    // Byte offsets in `text` of printed characters on the current line, so
    // backspace never eats into a kept SGR sequence.
    printed: Vec<usize>,
    out: Vec<Fragment>,
}

impl BlockFilter {
    fn flush_text(&mut self) {
        self.printed.clear();
        if !self.text.is_empty() {
            self.out.push(Fragment::Text(std::mem::take(&mut self.text)));
        }
    }

    fn push_printed(&mut self, c: char) {
        self.printed.push(self.text.len());
        self.text.push(c);
    }

    fn take(&mut self) -> Vec<Fragment> {
        self.flush_text();
        std::mem::take(&mut self.out)
    }
}

impl Perform for BlockFilter {
    fn print(&mut self, c: char) {
        self.push_printed(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.printed.clear();
                self.text.push('\n');
            }
            b'\t' => self.push_printed('\t'),
            0x08 => {
                if let Some(at) = self.printed.pop() {
                    self.text.remove(at);
                }
            }
            0x07 => {
                self.flush_text();
                self.out.push(Fragment::Bell);
            }
            // CR, SO/SI and the rest move a cursor we don't have
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if action != 'm' || ignore || !intermediates.is_empty() {
            return;
        }

        let encoded = params
            .iter()
            .map(|sub| {
                sub.iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .collect::<Vec<_>>()
            .join(";");

        self.text.push_str("\x1b[");
        self.text.push_str(&encoded);
        self.text.push('m');
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        match parse_osc_params(params) {
            // titles, hyperlinks, palette queries
            OscEvent::Unknown(_) => {}
            marker => {
                self.flush_text();
                self.out.push(Fragment::Marker(marker));
            }
        }
    }
}
