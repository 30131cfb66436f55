//! Headless mode - JSON event output
//!
//! `dlink run` writes one JSON object per line (NDJSON) to stdout for every
//! session event, so the stream can be piped into `jq` or a test script.
//! Logs go to the log file, never to stdout.
//!
//! # Example Output
//!
//! ```json
//! {"event":"started","url":"wss://test.deribit.com/ws/api/v2","channels":["book.BTC-PERPETUAL.100ms"],"timestamp":1704700001000}
//! {"event":"state_changed","from":"authenticating","to":"authenticated","timestamp":1704700001200}
//! {"event":"notification","channel":"book.BTC-PERPETUAL.100ms","data":{"change_id":1},"timestamp":1704700001300}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};
use tracing::error;

use dlink_core::{SessionEvent, SessionState};

/// Events emitted in headless mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// The session task was spawned
    Started {
        url: String,
        channels: Vec<String>,
        timestamp: i64,
    },

    StateChanged {
        from: SessionState,
        to: SessionState,
        timestamp: i64,
    },

    /// Initial grant or refresh succeeded
    Authenticated {
        refreshed: bool,
        valid_for_secs: u64,
        timestamp: i64,
    },

    Subscribed {
        channels: Vec<String>,
        timestamp: i64,
    },

    SubscribeFailed {
        channels: Vec<String>,
        message: String,
        timestamp: i64,
    },

    /// Channel push, `data` forwarded as received
    Notification {
        channel: String,
        data: Value,
        timestamp: i64,
    },

    Closed {
        reason: String,
        timestamp: i64,
    },

    /// Answer to the `state` stdin command
    State {
        state: SessionState,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        // Consumers read line by line
        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn started(url: &str, channels: &[String]) -> Self {
        Self::Started {
            url: url.to_string(),
            channels: channels.to_vec(),
            timestamp: Self::now(),
        }
    }

    pub fn state(state: SessionState) -> Self {
        Self::State {
            state,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

impl From<SessionEvent> for HeadlessEvent {
    fn from(event: SessionEvent) -> Self {
        let timestamp = Self::now();
        match event {
            SessionEvent::StateChanged { from, to } => Self::StateChanged {
                from,
                to,
                timestamp,
            },
            SessionEvent::Authenticated {
                refreshed,
                valid_for_secs,
            } => Self::Authenticated {
                refreshed,
                valid_for_secs,
                timestamp,
            },
            SessionEvent::Subscribed { channels } => Self::Subscribed {
                channels,
                timestamp,
            },
            SessionEvent::SubscribeFailed { channels, message } => Self::SubscribeFailed {
                channels,
                message,
                timestamp,
            },
            SessionEvent::Notification { channel, data } => Self::Notification {
                channel,
                data,
                timestamp,
            },
            SessionEvent::Closed { reason } => Self::Closed { reason, timestamp },
        }
    }
}
