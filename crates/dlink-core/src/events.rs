//! Events delivered from the session to application code

use serde::Serialize;
use serde_json::Value;

use crate::types::SessionState;

/// Everything the session reports to its consumer.
///
/// Channel pushes arrive as [`SessionEvent::Notification`] with the server's
/// `params.data` forwarded untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The controller moved to a new lifecycle state.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },

    /// A credential exchange succeeded.
    Authenticated {
        /// `true` for a refresh, `false` for the initial grant.
        refreshed: bool,
        /// Seconds until the new token is treated as expired.
        valid_for_secs: u64,
    },

    /// The server acknowledged a subscribe request.
    Subscribed { channels: Vec<String> },

    /// The server rejected a subscribe request.
    SubscribeFailed {
        channels: Vec<String>,
        message: String,
    },

    /// A market-data push for a subscribed channel.
    Notification { channel: String, data: Value },

    /// The connection ended and will not be reused.
    Closed { reason: String },
}

impl SessionEvent {
    /// Channel name for notifications, `None` for lifecycle events.
    pub fn channel(&self) -> Option<&str> {
        match self {
            SessionEvent::Notification { channel, .. } => Some(channel),
            _ => None,
        }
    }
}
