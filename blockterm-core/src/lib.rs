pub mod blocks;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod focus;
pub mod handoff;
pub mod pty_manager;
pub mod runtime;
pub mod session;
pub mod state_machine;
pub mod term;

// Re-export the main struct so users can just use `blockterm_core::SessionEngine`
pub use engine::SessionEngine;

// Re-export the simpler types for the UI
pub use blocks::{Block, BlockId, BlockOrigin, BlockSnapshot, BlockStatus};
pub use config::{ClassifierOverrides, SessionConfig};
pub use connection::{
    Connection, ConnectionEvent, Connector, ScriptHandle, ScriptedConnection, ScriptedConnector, SessionKind,
};
pub use error::{BlockError, SessionError};
pub use focus::{FocusArbiter, InputRoute};
pub use handoff::{FullscreenExit, InputSink, TerminalEmulator};
pub use pty_manager::PtyConnector;
pub use runtime::{Classification, Classifier, CommandProfile};
pub use session::{BlockField, InputEvent, Session, SessionEvent};
pub use state_machine::HeadlessEmulator;
