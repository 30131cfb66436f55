//! In-memory transport for driving a session without a socket.
//!
//! Enabled for unit tests and, for other crates, through the `test-helpers`
//! feature.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use dlink_core::prelude::*;

use crate::credentials::FormPoster;
use crate::transport::{Connection, Connector, TransportEvent};

/// The server's side of an in-memory [`Connection`].
#[derive(Debug)]
pub struct ConnectionPeer {
    /// Frames the session wrote, in order.
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Events delivered to the session.
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl Connection {
    /// A connected pair: the session end and the scripted server end.
    pub fn pair() -> (Connection, ConnectionPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(64);
        (
            Connection::new(out_tx, in_rx),
            ConnectionPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

impl ConnectionPeer {
    /// Deliver one text frame to the session.
    pub async fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Frame(text.into())).await;
    }

    /// Deliver a JSON value as one frame.
    pub async fn push_json(&self, value: Value) {
        self.push(value.to_string()).await;
    }

    /// Report the connection as closed.
    pub async fn close(&self, reason: &str) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed(reason.to_string()))
            .await;
    }

    /// Wait for the next frame the session sent, parsed as JSON.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let text = self.outbound.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Take an already-sent frame without waiting.
    pub fn try_frame(&mut self) -> Option<Value> {
        let text = self.outbound.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Drain every frame sent so far.
    pub fn drain(&mut self) -> Vec<Value> {
        std::iter::from_fn(|| self.try_frame()).collect()
    }
}

/// A [`Connector`] that hands out prepared connections in order.
///
/// Once the queue is empty every further attempt fails with
/// [`Error::Connect`].
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    connections: Mutex<VecDeque<Result<Connection>>>,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fresh in-memory connection and return its server end.
    pub fn push_pair(&self) -> ConnectionPeer {
        let (conn, peer) = Connection::pair();
        self.lock_connections().push_back(Ok(conn));
        peer
    }

    /// Queue a failed attempt.
    pub fn push_failure(&self, message: &str) {
        self.lock_connections()
            .push_back(Err(Error::connect(message.to_string())));
    }

    /// URLs passed to `connect`, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        self.lock_connections()
            .pop_front()
            .unwrap_or_else(|| Err(Error::connect("no scripted connection left")))
    }
}

/// A [`FormPoster`] that answers every POST with the same body.
#[derive(Debug, Default)]
pub struct CannedPoster {
    body: Option<String>,
    requests: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl CannedPoster {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A poster for in-band sessions; any call fails.
    pub fn unused() -> Self {
        Self::default()
    }

    /// Every `(url, fields)` posted so far.
    pub fn requests(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl FormPoster for CannedPoster {
    async fn post_form(&self, url: &str, fields: &BTreeMap<String, String>) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((url.to_string(), fields.clone()));
        self.body
            .clone()
            .ok_or_else(|| Error::http("no canned response"))
    }
}
