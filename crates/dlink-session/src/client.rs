//! Public handle to a running session.
//!
//! [`SessionClient::start`] spawns the controller task and returns
//! immediately. The handle talks to the task over a command channel and
//! receives [`SessionEvent`]s over an event channel; dropping the handle
//! shuts the session down.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dlink_core::prelude::*;
use dlink_core::{SessionEvent, SessionState};

use super::credentials::FormPoster;
use super::session::{run_session, SessionConfig};
use super::transport::Connector;

/// Capacity of the command channel.
const CMD_CHANNEL_CAPACITY: usize = 32;

/// Messages from the handle to the controller task.
#[derive(Debug)]
pub(crate) enum ClientCommand {
    /// Add channels to the desired set and subscribe when possible.
    Subscribe { channels: Vec<String> },
    /// Close the connection and stop the task.
    Shutdown,
}

/// Handle to the session controller task.
pub struct SessionClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.state())
            .finish()
    }
}

impl SessionClient {
    /// Spawn the session task. Must be called inside a Tokio runtime.
    pub fn start<C, P>(config: SessionConfig, connector: C, poster: P) -> Self
    where
        C: Connector + Sync + 'static,
        P: FormPoster + Sync + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SessionState::Disconnected));

        let task = tokio::spawn(run_session(
            config,
            connector,
            poster,
            cmd_rx,
            event_tx,
            state.clone(),
        ));

        Self {
            cmd_tx,
            event_rx,
            state,
            task: Some(task),
        }
    }

    /// Subscribe to `channels`.
    ///
    /// The channels join the desired set immediately and are sent once the
    /// session is authenticated (or right away if it already is).
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] if the session task has ended.
    pub async fn subscribe(&self, channels: Vec<String>) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Subscribe { channels })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Lifecycle events and channel notifications, in the order they
    /// happened. The queue is unbounded, so keep draining it.
    pub fn event_receiver(&mut self) -> &mut mpsc::UnboundedReceiver<SessionEvent> {
        &mut self.event_rx
    }

    /// Stop the session and wait for the task to finish.
    ///
    /// In-flight requests are abandoned.
    pub async fn shutdown(mut self) -> Result<()> {
        // The task may already have ended after a failure.
        let _ = self.cmd_tx.send(ClientCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::channel_send(format!("session task panicked: {e}")))?;
        }
        Ok(())
    }
}
