//! Byte-stream handling that sits *next to* the emulator.
//!
//! - `processor`: decode + filter connection output for block rendering
//! - `osc`: OSC 7 cwd / OSC 133 prompt markers, plus a streaming scanner
//! - `modes`: lightweight CSI mode tracker (alt-screen, mouse reporting, bracketed paste)
//! - `semantic`: prompt/command state derived from OSC markers

pub mod modes;
pub mod osc;
pub mod processor;
pub mod semantic;

pub use modes::{ModeChange, ModeSnapshot, ModeTracker};
pub use osc::{OscEvent, OscScanner};
pub use processor::{EncodingHint, Fragment, OutputProcessor, Processed, ProcessorMode};
pub use semantic::{SemanticEvent, SemanticState};
