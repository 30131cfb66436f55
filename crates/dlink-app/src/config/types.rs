//! Configuration types for deribit-link
//!
//! Mirrors the sections of `.dlink/config.toml`. Every field has a default,
//! so a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};

/// Global settings from `.dlink/config.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub refresh: RefreshSettings,

    #[serde(default)]
    pub subscriptions: SubscriptionSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

// ─────────────────────────────────────────────────────────────────────────────
// [connection]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// WebSocket endpoint
    #[serde(default = "default_url")]
    pub url: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self { url: default_url() }
    }
}

impl ConnectionSettings {
    /// Whether the endpoint is the Deribit test environment.
    pub fn is_testnet(&self) -> bool {
        self.url.contains("test.deribit.com")
    }
}

fn default_url() -> String {
    dlink_session::DEFAULT_WS_URL.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// [auth]
// ─────────────────────────────────────────────────────────────────────────────

/// Where the initial credential grant is performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthModeSetting {
    /// `public/auth` over the WebSocket
    #[default]
    InBand,
    /// HTTP form POST to `token_url` before connecting
    OutOfBand,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub mode: AuthModeSetting,

    /// Token endpoint for out-of-band mode
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Seconds to wait for an auth or refresh answer
    #[serde(default = "default_auth_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthModeSetting::default(),
            token_url: default_token_url(),
            timeout_secs: default_auth_timeout(),
        }
    }
}

fn default_token_url() -> String {
    "https://test.deribit.com/api/v2/public/auth".to_string()
}

fn default_auth_timeout() -> u64 {
    10
}

// ─────────────────────────────────────────────────────────────────────────────
// [heartbeat]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    /// Server heartbeat interval in seconds (minimum 10)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    10
}

// ─────────────────────────────────────────────────────────────────────────────
// [refresh]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicySetting {
    /// Refresh exactly when the token expires
    #[default]
    Deadline,
    /// Check every `poll_secs`
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RefreshSettings {
    #[serde(default)]
    pub policy: RefreshPolicySetting,

    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,

    /// Subtracted from `expires_in`
    #[serde(default = "default_margin_secs")]
    pub margin_secs: u64,

    /// Fixed lifetime for test-environment tokens
    #[serde(default = "default_testnet_lifetime_secs")]
    pub testnet_lifetime_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            policy: RefreshPolicySetting::default(),
            poll_secs: default_poll_secs(),
            margin_secs: default_margin_secs(),
            testnet_lifetime_secs: default_testnet_lifetime_secs(),
        }
    }
}

fn default_poll_secs() -> u64 {
    150
}

fn default_margin_secs() -> u64 {
    240
}

fn default_testnet_lifetime_secs() -> u64 {
    300
}

// ─────────────────────────────────────────────────────────────────────────────
// [subscriptions]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubscriptionSettings {
    /// Channels subscribed after every authentication
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

fn default_ack_timeout() -> u64 {
    30
}

// ─────────────────────────────────────────────────────────────────────────────
// [reconnect]
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicySetting {
    #[default]
    Never,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default)]
    pub policy: ReconnectPolicySetting,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicySetting::default(),
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    30
}
