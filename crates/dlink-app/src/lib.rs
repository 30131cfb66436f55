//! # dlink-app - Application configuration
//!
//! Turns `.dlink/config.toml` and the environment into a
//! [`dlink_session::SessionConfig`].

pub mod config;

pub use config::{credentials_from_env, load_settings, load_settings_from, Settings};
