//! Configuration file parsing for deribit-link
//!
//! Supports:
//! - `.dlink/config.toml` - session settings
//! - `DERIBIT_API_KEY` / `DERIBIT_API_SECRET` - credentials

pub mod settings;
pub mod types;

pub use settings::{
    credentials_from_env, init_config_dir, load_settings, load_settings_from, API_KEY_ENV,
    API_SECRET_ENV,
};
pub use types::*;
