//! Settings parser for .dlink/config.toml

use std::path::Path;
use std::time::Duration;

use dlink_core::prelude::*;
use dlink_session::{
    AuthMode, Credentials, LifetimePolicy, ReconnectPolicy, RefreshPolicy, SessionConfig,
};

use super::types::{AuthModeSetting, ReconnectPolicySetting, RefreshPolicySetting, Settings};

const CONFIG_FILENAME: &str = "config.toml";
const DLINK_DIR: &str = ".dlink";

/// Environment variable holding the API key (client id).
pub const API_KEY_ENV: &str = "DERIBIT_API_KEY";
/// Environment variable holding the API secret.
pub const API_SECRET_ENV: &str = "DERIBIT_API_SECRET";

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load settings from `.dlink/config.toml` under `project_path`.
///
/// A missing, unreadable or invalid file yields the defaults.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = project_path.join(DLINK_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match load_settings_from(&config_path) {
        Ok(settings) => {
            debug!("Loaded settings from {:?}", config_path);
            settings
        }
        Err(e) => {
            warn!("{}; using defaults", e);
            Settings::default()
        }
    }
}

/// Load settings from an explicit file.
///
/// # Errors
///
/// [`Error::ConfigInvalid`] if the file cannot be read or parsed.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config_invalid(format!("Failed to read {:?}: {}", path, e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::config_invalid(format!("Failed to parse {:?}: {}", path, e)))
}

/// Create a commented default config in `.dlink/` (never overwrites).
pub fn init_config_dir(project_path: &Path) -> Result<()> {
    let dlink_dir = project_path.join(DLINK_DIR);

    if !dlink_dir.exists() {
        std::fs::create_dir_all(&dlink_dir)
            .map_err(|e| Error::config(format!("Failed to create .dlink dir: {}", e)))?;
    }

    let config_path = dlink_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        let default_content = r#"# deribit-link configuration
# Credentials are read from DERIBIT_API_KEY / DERIBIT_API_SECRET.

[connection]
url = "wss://test.deribit.com/ws/api/v2"

[auth]
mode = "in_band"            # or "out_of_band"
token_url = "https://test.deribit.com/api/v2/public/auth"
timeout_secs = 10

[heartbeat]
interval_secs = 10          # server minimum is 10

[refresh]
policy = "deadline"         # or "poll"
poll_secs = 150
margin_secs = 240
testnet_lifetime_secs = 300

[subscriptions]
channels = ["book.BTC-PERPETUAL.100ms"]
ack_timeout_secs = 30

[reconnect]
policy = "never"            # or "backoff"
max_attempts = 10
initial_backoff_secs = 1
max_backoff_secs = 30
"#;
        std::fs::write(&config_path, default_content)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
        info!("Created default config at {:?}", config_path);
    }

    Ok(())
}

/// Read API credentials from the environment.
///
/// Unset variables become empty strings; the server rejects them at
/// authentication time.
pub fn credentials_from_env() -> Credentials {
    let read = |name: &str| match std::env::var(name) {
        Ok(value) => value,
        Err(_) => {
            debug!("{} not set", name);
            String::new()
        }
    };
    Credentials::new(read(API_KEY_ENV), read(API_SECRET_ENV))
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

impl Settings {
    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_url(&self.connection.url, &["ws", "wss"], "connection.url")?;
        if self.auth.mode == AuthModeSetting::OutOfBand {
            check_url(&self.auth.token_url, &["http", "https"], "auth.token_url")?;
        }

        let positive = [
            ("auth.timeout_secs", self.auth.timeout_secs),
            ("refresh.poll_secs", self.refresh.poll_secs),
            ("subscriptions.ack_timeout_secs", self.subscriptions.ack_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config_invalid(format!("{name} must be positive")));
            }
        }

        if self.reconnect.policy == ReconnectPolicySetting::Backoff
            && self.reconnect.max_backoff_secs < self.reconnect.initial_backoff_secs
        {
            return Err(Error::config_invalid(
                "reconnect.max_backoff_secs is smaller than initial_backoff_secs",
            ));
        }

        Ok(())
    }

    /// Build the session configuration.
    ///
    /// `extra_channels` (e.g. from the command line) are appended to the
    /// configured ones.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] if [`Settings::validate`] fails.
    pub fn into_session_config(
        self,
        credentials: Credentials,
        extra_channels: Vec<String>,
    ) -> Result<SessionConfig> {
        self.validate()?;

        let auth_mode = match self.auth.mode {
            AuthModeSetting::InBand => AuthMode::InBand,
            AuthModeSetting::OutOfBand => AuthMode::OutOfBand {
                token_url: self.auth.token_url,
            },
        };
        let refresh_policy = match self.refresh.policy {
            RefreshPolicySetting::Deadline => RefreshPolicy::Deadline,
            RefreshPolicySetting::Poll => RefreshPolicy::Poll {
                period: Duration::from_secs(self.refresh.poll_secs),
            },
        };
        let reconnect = match self.reconnect.policy {
            ReconnectPolicySetting::Never => ReconnectPolicy::Never,
            ReconnectPolicySetting::Backoff => ReconnectPolicy::Backoff {
                max_attempts: self.reconnect.max_attempts,
                initial: Duration::from_secs(self.reconnect.initial_backoff_secs),
                max: Duration::from_secs(self.reconnect.max_backoff_secs),
            },
        };

        let mut channels = self.subscriptions.channels;
        channels.extend(extra_channels);

        Ok(SessionConfig {
            url: self.connection.url,
            credentials,
            auth_mode,
            auth_timeout: Duration::from_secs(self.auth.timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat.interval_secs),
            refresh_policy,
            lifetime: LifetimePolicy {
                margin: Duration::from_secs(self.refresh.margin_secs),
                testnet_lifetime: Duration::from_secs(self.refresh.testnet_lifetime_secs),
            },
            channels,
            ack_timeout: Duration::from_secs(self.subscriptions.ack_timeout_secs),
            reconnect,
        })
    }
}

fn check_url(value: &str, schemes: &[&str], field: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| Error::config_invalid(format!("{field} {value:?} is not a URL: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(Error::config_invalid(format!(
            "{field} must use one of {:?}, got {:?}",
            schemes,
            url.scheme()
        )));
    }
    Ok(())
}
