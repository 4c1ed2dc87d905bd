use crate::blocks::{Block, BlockId, BlockSnapshot};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionEvent, Connector};
use crate::error::SessionError;
use crate::handoff::FullscreenExit;
use crate::session::{InputEvent, Session, SessionEvent};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Async front of a [`Session`].
/// The UI holds one instance of this per session.
#[derive(Debug)]
pub struct SessionEngine {
    pub session: Arc<Mutex<Session>>,
    pump: JoinHandle<()>,
}

impl SessionEngine {
    /// Opens the connection, builds the session, and starts pumping its
    /// output into the blocks.
    pub async fn start(connector: &dyn Connector, config: SessionConfig) -> Result<Self> {
        let (connection, events) = connector
            .open(&config)
            .context("Failed to open session connection")?;
        Ok(Self::attach(connection, events, config))
    }

    /// Wrap an already-open connection. Must be called inside a tokio runtime.
    pub fn attach(
        connection: Box<dyn Connection>,
        events: mpsc::Receiver<ConnectionEvent>,
        config: SessionConfig,
    ) -> Self {
        Self::from_session(Session::new(config, connection), events)
    }

    pub fn from_session(mut session: Session, events: mpsc::Receiver<ConnectionEvent>) -> Self {
        let input = session.take_input_receiver();
        let session = Arc::new(Mutex::new(session));
        let pump = tokio::spawn(pump(session.clone(), events, input));
        Self { session, pump }
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.lock().await.subscribe()
    }

    pub async fn submit(&self, command: &str) -> Result<BlockId, SessionError> {
        self.session.lock().await.submit(command)
    }

    pub async fn send_raw_input(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.session.lock().await.send_raw_input(bytes)
    }

    pub async fn handle_input(&self, input: InputEvent) -> Result<Option<BlockId>, SessionError> {
        self.session.lock().await.handle_input(input)
    }

    pub async fn cancel_focused(&self) -> Result<BlockId, SessionError> {
        self.session.lock().await.cancel_focused()
    }

    pub async fn cancel(&self, id: BlockId) -> Result<bool, SessionError> {
        self.session.lock().await.cancel(id)
    }

    pub async fn request_focus(&self, id: BlockId) -> Result<(), SessionError> {
        self.session.lock().await.request_focus(id)
    }

    pub async fn clear_focus(&self) -> Option<BlockId> {
        self.session.lock().await.clear_focus()
    }

    /// UI window resized -> resize the connection and the fullscreen grid.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.session.lock().await.resize(cols, rows)
    }

    pub async fn clear_all(&self) -> Result<(), SessionError> {
        self.session.lock().await.clear_all()
    }

    pub async fn close_fullscreen(&self) -> Result<Option<BlockId>, SessionError> {
        self.session.lock().await.close_fullscreen()
    }

    pub async fn finish_fullscreen(&self, exit: FullscreenExit) -> Option<BlockId> {
        self.session.lock().await.finish_fullscreen(exit)
    }

    pub async fn snapshot(&self) -> Vec<BlockSnapshot> {
        self.session.lock().await.snapshot()
    }

    pub async fn focused(&self) -> Option<BlockId> {
        self.session.lock().await.focused()
    }

    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.is_closed()
    }

    /// Close the session and stop the pump. Returns the released blocks.
    pub async fn close(&self) -> Vec<Block> {
        let blocks = self.session.lock().await.close();
        self.pump.abort();
        blocks
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn next_input(input: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match input {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The "pump" task: connection events and emulator input -> session.
async fn pump(
    session: Arc<Mutex<Session>>,
    mut events: mpsc::Receiver<ConnectionEvent>,
    mut input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let mut s = session.lock().await;
                let Some(event) = event else {
                    s.connection_lost();
                    break;
                };

                s.handle_connection_event(event);
                // COALESCING: take whatever else is already queued under the same lock
                while let Ok(more) = events.try_recv() {
                    s.handle_connection_event(more);
                }
                if s.is_closed() {
                    break;
                }
            }

            Some(bytes) = next_input(&mut input) => {
                session.lock().await.write_fullscreen_input(&bytes);
            }
        }
    }
    debug!("Session pump ended");
}
