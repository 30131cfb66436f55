//! JSON-RPC 2.0 wire codec for the Deribit WebSocket API.
//!
//! Every frame on the socket is one JSON-RPC 2.0 object. Outbound frames are
//! requests; inbound frames are either responses (carrying the `id` of the
//! request they answer) or notifications (no `id`, a `method` such as
//! `"heartbeat"` or `"subscription"`).
//!
//! The upstream protocol correlates by a small table of literal ids, one per
//! kind of request, rather than by a generated sequence:
//!
//! | Kind | id | method |
//! |---|---|---|
//! | auth / refresh | 9929 | `public/auth` |
//! | heartbeat ack | 8212 | `public/test` |
//! | heartbeat config | 9098 | `public/set_heartbeat` |
//! | subscribe | 42 | `public/subscribe` |
//!
//! [`PendingRequests`] remembers what each outstanding id means so a
//! response can be routed to the component that issued it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use dlink_core::prelude::*;

/// Always `"2.0"`.
pub const JSONRPC_VERSION: &str = "2.0";

/// Id shared by the initial credential grant and every refresh.
pub const AUTH_REQUEST_ID: u64 = 9929;
/// Id of the `public/test` frame answering a server heartbeat.
pub const HEARTBEAT_ACK_ID: u64 = 8212;
/// Id of the one-time `public/set_heartbeat` call.
pub const SET_HEARTBEAT_ID: u64 = 9098;
/// Id of every `public/subscribe` call.
pub const SUBSCRIBE_ID: u64 = 42;

/// Method names used on the wire.
pub mod method {
    pub const AUTH: &str = "public/auth";
    pub const SET_HEARTBEAT: &str = "public/set_heartbeat";
    pub const TEST: &str = "public/test";
    pub const SUBSCRIBE: &str = "public/subscribe";

    /// Server-initiated liveness ping (notification).
    pub const HEARTBEAT: &str = "heartbeat";
    /// Channel push (notification).
    pub const SUBSCRIPTION: &str = "subscription";
}

// ---------------------------------------------------------------------------
// Request kinds
// ---------------------------------------------------------------------------

/// Semantic meaning of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `client_credentials` grant.
    Auth,
    /// `refresh_token` grant.
    Refresh,
    /// `public/set_heartbeat`.
    HeartbeatConfig,
    /// `public/test` in answer to a heartbeat.
    HeartbeatAck,
    /// `public/subscribe`.
    Subscribe,
}

impl RequestKind {
    /// The well-known wire id for this kind.
    pub const fn id(self) -> u64 {
        match self {
            RequestKind::Auth | RequestKind::Refresh => AUTH_REQUEST_ID,
            RequestKind::HeartbeatConfig => SET_HEARTBEAT_ID,
            RequestKind::HeartbeatAck => HEARTBEAT_ACK_ID,
            RequestKind::Subscribe => SUBSCRIBE_ID,
        }
    }

    /// The JSON-RPC method this kind is sent with.
    pub const fn method(self) -> &'static str {
        match self {
            RequestKind::Auth | RequestKind::Refresh => method::AUTH,
            RequestKind::HeartbeatConfig => method::SET_HEARTBEAT,
            RequestKind::HeartbeatAck => method::TEST,
            RequestKind::Subscribe => method::SUBSCRIBE,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RequestKind::Auth => "auth",
            RequestKind::Refresh => "refresh",
            RequestKind::HeartbeatConfig => "heartbeat-config",
            RequestKind::HeartbeatAck => "heartbeat-ack",
            RequestKind::Subscribe => "subscribe",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlation id, taken from the fixed table.
    pub id: u64,
    /// Method name, e.g. `"public/auth"`.
    pub method: String,
    /// Method parameters; `{}` when the method takes none.
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a request for `kind` using its well-known id and method.
    pub fn for_kind(kind: RequestKind, params: Value) -> Self {
        Self::new(kind.id(), kind.method(), params)
    }

    /// Serialize to the text of one WebSocket frame.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Encode a request frame from its parts.
pub fn encode(id: u64, method: &str, params: Value) -> Result<String> {
    JsonRpcRequest::new(id, method, params).encode()
}

/// JSON-RPC 2.0 response to one of our requests.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    /// The id of the request being answered.
    pub id: u64,
    /// Successful result payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error payload, present when the call failed.
    #[serde(default)]
    pub error: Option<RpcError>,
    /// Set by the server when talking to the test environment.
    #[serde(default)]
    pub testnet: bool,
    /// Server receive timestamp (microseconds).
    #[serde(rename = "usIn", default)]
    pub us_in: Option<u64>,
    /// Server send timestamp (microseconds).
    #[serde(rename = "usOut", default)]
    pub us_out: Option<u64>,
}

impl RpcResponse {
    /// Split into the result or a domain error.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            Err(Error::rpc(error.code, error.message))
        } else if let Some(result) = self.result {
            Ok(result)
        } else {
            Err(Error::malformed(format!(
                "response {} contained neither result nor error",
                self.id
            )))
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Server-initiated message without an id.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn is_heartbeat(&self) -> bool {
        self.method == method::HEARTBEAT
    }

    /// Extract `(channel, data)` from a `"subscription"` push.
    pub fn subscription(&self) -> Option<(String, Value)> {
        if self.method != method::SUBSCRIPTION {
            return None;
        }
        let channel = self.params.get("channel")?.as_str()?.to_string();
        let data = self.params.get("data").cloned().unwrap_or(Value::Null);
        Some((channel, data))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Message {
    Response(RpcResponse),
    Notification(Notification),
}

/// Decode one inbound text frame.
///
/// Dispatch logic:
/// - non-null top-level `"id"` → [`Message::Response`]
/// - `"method"` without an id → [`Message::Notification`]
/// - anything else, including empty or non-JSON bodies →
///   [`Error::MalformedMessage`]
pub fn decode(text: &str) -> Result<Message> {
    if text.trim().is_empty() {
        return Err(Error::malformed("empty frame"));
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::malformed(format!("invalid JSON: {e}")))?;

    if !value.is_object() {
        return Err(Error::malformed("frame is not a JSON object"));
    }

    let has_id = value.get("id").is_some_and(|v| !v.is_null());
    let has_method = value.get("method").is_some_and(|v| v.is_string());

    if has_id {
        serde_json::from_value::<RpcResponse>(value)
            .map(Message::Response)
            .map_err(|e| Error::malformed(format!("bad response shape: {e}")))
    } else if has_method {
        serde_json::from_value::<Notification>(value)
            .map(Message::Notification)
            .map_err(|e| Error::malformed(format!("bad notification shape: {e}")))
    } else {
        Err(Error::malformed("frame has neither id nor method"))
    }
}

/// Shorten a frame for log output.
pub(crate) fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    &text[..end]
}

// ---------------------------------------------------------------------------
// Pending request registry
// ---------------------------------------------------------------------------

/// One outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    /// Channels carried by a subscribe request; empty for other kinds.
    pub channels: Vec<String>,
    pub sent_at: Instant,
}

/// Tracks in-flight requests by their fixed id.
///
/// Several requests of the same kind may be in flight under one id (two
/// subscribe calls, for instance). The server answers in order on a single
/// connection, so each id keeps a FIFO and a response completes the oldest
/// entry. An id disappears from the registry once its queue drains.
#[derive(Debug, Default)]
pub struct PendingRequests {
    pending: HashMap<u64, VecDeque<PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a request of `kind` was just sent.
    pub fn register(&mut self, kind: RequestKind, channels: Vec<String>, now: Instant) {
        self.pending
            .entry(kind.id())
            .or_default()
            .push_back(PendingRequest {
                kind,
                channels,
                sent_at: now,
            });
    }

    /// Take the oldest pending request with `id`, if any.
    pub fn complete(&mut self, id: u64) -> Option<PendingRequest> {
        let queue = self.pending.get_mut(&id)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&id);
        }
        entry
    }

    /// Whether any request of `kind` is outstanding.
    pub fn contains_kind(&self, kind: RequestKind) -> bool {
        self.pending
            .get(&kind.id())
            .is_some_and(|queue| queue.iter().any(|p| p.kind == kind))
    }

    /// Remove every request older than `timeout`, returning them.
    pub fn cleanup_stale(&mut self, timeout: Duration, now: Instant) -> Vec<PendingRequest> {
        let mut stale = Vec::new();
        self.pending.retain(|_, queue| {
            while queue
                .front()
                .is_some_and(|p| now.saturating_duration_since(p.sent_at) > timeout)
            {
                if let Some(p) = queue.pop_front() {
                    stale.push(p);
                }
            }
            !queue.is_empty()
        });
        stale
    }

    /// Drop everything, e.g. when the connection is replaced.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Total number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
