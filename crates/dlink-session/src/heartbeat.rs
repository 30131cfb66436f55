//! Heartbeat responder.
//!
//! After connect the session asks the server for heartbeats every `interval`
//! seconds (`public/set_heartbeat`). From then on the server sends
//! `heartbeat` notifications and expects a `public/test` call back for each
//! one; a session that stops answering is dropped by the server.
//!
//! The responder holds no timer of its own. It is driven entirely by inbound
//! notifications, and the controller enqueues the acknowledgement before it
//! looks at anything else in the frame loop.

use std::time::Duration;

use serde_json::{json, Value};

use dlink_core::prelude::*;

use super::protocol::{JsonRpcRequest, Notification, RequestKind};

/// Smallest interval the server accepts.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// The `params.type` of a heartbeat notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatType {
    /// Informational ping.
    Heartbeat,
    /// The server explicitly demands a `public/test` answer.
    TestRequest,
    /// Missing or unrecognised type.
    Unknown,
}

impl HeartbeatType {
    pub fn from_params(params: &Value) -> Self {
        match params.get("type").and_then(Value::as_str) {
            Some("heartbeat") => HeartbeatType::Heartbeat,
            Some("test_request") => HeartbeatType::TestRequest,
            _ => HeartbeatType::Unknown,
        }
    }
}

/// Heartbeat configuration and bookkeeping.
#[derive(Debug, Clone)]
pub struct HeartbeatResponder {
    interval: Duration,
    acks_sent: u64,
}

impl HeartbeatResponder {
    /// Intervals below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn new(interval: Duration) -> Self {
        let interval = if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                "Heartbeat interval {:?} below server minimum, using {:?}",
                interval, MIN_HEARTBEAT_INTERVAL
            );
            MIN_HEARTBEAT_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            acks_sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The one-time `public/set_heartbeat` request.
    pub fn setup_request(&self) -> JsonRpcRequest {
        JsonRpcRequest::for_kind(
            RequestKind::HeartbeatConfig,
            json!({ "interval": self.interval.as_secs() }),
        )
    }

    /// Build the acknowledgement for one heartbeat notification.
    ///
    /// Returns `None` for notifications that are not heartbeats.
    pub fn on_notification(&mut self, notification: &Notification) -> Option<JsonRpcRequest> {
        if !notification.is_heartbeat() {
            return None;
        }
        let kind = HeartbeatType::from_params(&notification.params);
        trace!("Heartbeat received ({:?})", kind);
        self.acks_sent += 1;
        Some(JsonRpcRequest::for_kind(RequestKind::HeartbeatAck, json!({})))
    }

    /// Record the server's answer to `public/set_heartbeat`.
    pub fn on_setup_response(&self, result: Result<Value>) {
        match result {
            Ok(_) => debug!("Server heartbeat set to {}s", self.interval.as_secs()),
            Err(e) => warn!("public/set_heartbeat rejected: {}", e),
        }
    }

    /// Forget per-connection state; the interval is kept.
    pub fn reset(&mut self) {
        self.acks_sent = 0;
    }

    /// Acknowledgements built since the last [`Self::reset`].
    pub fn acks_sent(&self) -> u64 {
        self.acks_sent
    }
}

impl Default for HeartbeatResponder {
    fn default() -> Self {
        Self::new(MIN_HEARTBEAT_INTERVAL)
    }
}
