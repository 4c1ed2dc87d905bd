//! Connection providers.
//!
//! A session talks to exactly one connection: a local shell on a PTY or a
//! remote shell handed over by some transport. The session only needs the
//! capability below plus a single ordered stream of [`ConnectionEvent`]s.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SessionConfig;

/// Capacity of a provider's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Local,
    Remote,
}

/// What a connection reports back, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Output(Vec<u8>),
    /// The process behind the connection is gone.
    Exited { code: Option<i32> },
    /// Transport-level failure. The connection may or may not survive it.
    Error(String),
}

pub trait Connection: Send + fmt::Debug {
    fn kind(&self) -> SessionKind;

    fn is_open(&self) -> bool;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Ask the foreground program to stop. Cooperative: ETX by default.
    fn interrupt(&mut self) -> Result<()> {
        self.write(&[0x03])
    }

    fn close(&mut self) -> Result<()>;
}

/// Opens connections. Returns the handle and its event stream.
pub trait Connector {
    fn open(
        &self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn Connection>, mpsc::Receiver<ConnectionEvent>)>;
}

// ============================================================================
// Scripted connection (in-memory, deterministic)
// ============================================================================

/// Everything a scripted connection was asked to do.
#[derive(Debug, Default, Clone)]
pub struct ScriptLog {
    pub writes: Vec<Vec<u8>>,
    pub resizes: Vec<(u16, u16)>,
    pub interrupts: usize,
    pub closed: bool,
}

#[derive(Debug)]
struct ScriptState {
    log: Mutex<ScriptLog>,
    open: AtomicBool,
    fail_writes: AtomicBool,
}

/// In-memory connection. Records writes and lets the other side (a
/// [`ScriptHandle`]) inject output, exits and errors.
#[derive(Debug)]
pub struct ScriptedConnection {
    kind: SessionKind,
    state: Arc<ScriptState>,
}

/// Control side of a [`ScriptedConnection`].
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    state: Arc<ScriptState>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ScriptedConnection {
    pub fn new(kind: SessionKind) -> (Self, ScriptHandle, mpsc::Receiver<ConnectionEvent>) {
        let state = Arc::new(ScriptState {
            log: Mutex::new(ScriptLog::default()),
            open: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let conn = Self { kind, state: state.clone() };
        (conn, ScriptHandle { state, events: tx }, rx)
    }

    fn log(&self) -> std::sync::MutexGuard<'_, ScriptLog> {
        self.state.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for ScriptedConnection {
    fn kind(&self) -> SessionKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            bail!("scripted connection is closed");
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            bail!("scripted write failure");
        }
        self.log().writes.push(data.to_vec());
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.log().resizes.push((cols, rows));
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        self.log().interrupts += 1;
        self.write(&[0x03])
    }

    fn close(&mut self) -> Result<()> {
        self.state.open.store(false, Ordering::SeqCst);
        self.log().closed = true;
        Ok(())
    }
}

impl ScriptHandle {
    pub fn log(&self) -> ScriptLog {
        self.state.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// All bytes written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.log().writes.concat()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        !self.state.open.load(Ordering::SeqCst)
    }

    /// Make the far side vanish without an exit report.
    pub fn disconnect(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn emit(&self, event: ConnectionEvent) -> Result<()> {
        if self.events.send(event).await.is_err() {
            bail!("scripted connection receiver dropped");
        }
        Ok(())
    }

    pub async fn output(&self, bytes: impl AsRef<[u8]>) -> Result<()> {
        self.emit(ConnectionEvent::Output(bytes.as_ref().to_vec())).await
    }

    pub async fn exit(&self, code: Option<i32>) -> Result<()> {
        self.emit(ConnectionEvent::Exited { code }).await
    }
}

/// Hands out one prepared [`ScriptedConnection`].
#[derive(Debug)]
pub struct ScriptedConnector {
    prepared: Mutex<Option<(ScriptedConnection, mpsc::Receiver<ConnectionEvent>)>>,
}

impl ScriptedConnector {
    pub fn new(kind: SessionKind) -> (Self, ScriptHandle) {
        let (conn, handle, rx) = ScriptedConnection::new(kind);
        let connector = Self { prepared: Mutex::new(Some((conn, rx))) };
        (connector, handle)
    }
}

impl Connector for ScriptedConnector {
    fn open(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Box<dyn Connection>, mpsc::Receiver<ConnectionEvent>)> {
        let prepared = self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match prepared {
            Some((conn, rx)) => Ok((Box::new(conn), rx)),
            None => bail!("scripted connector already opened"),
        }
    }
}
