//! Subscription manager.
//!
//! Tracks the set of channels the application wants (`desired`) and the set
//! the server has acknowledged on the current connection (`confirmed`). The
//! desired set survives reconnects and is replayed in a single
//! `public/subscribe` call.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use dlink_core::prelude::*;

use super::protocol::{JsonRpcRequest, RequestKind};

#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    desired: BTreeSet<String>,
    confirmed: BTreeSet<String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the desired set from configuration.
    pub fn with_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manager = Self::new();
        manager.desire(channels);
        manager
    }

    /// Add channels to the desired set without building a request.
    pub fn desire<I, S>(&mut self, channels: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = Vec::new();
        for channel in channels {
            let channel = channel.into();
            if channel.is_empty() {
                continue;
            }
            self.desired.insert(channel.clone());
            added.push(channel);
        }
        added
    }

    /// Record `channels` as desired and build the subscribe request for them.
    ///
    /// Already-desired channels are sent again; the server treats repeats as
    /// no-ops. Returns `None` for an empty list.
    pub fn subscribe<I, S>(&mut self, channels: I) -> Option<(JsonRpcRequest, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = self.desire(channels);
        if channels.is_empty() {
            return None;
        }
        Some((Self::request(&channels), channels))
    }

    /// A request re-issuing every desired channel.
    pub fn replay(&self) -> Option<(JsonRpcRequest, Vec<String>)> {
        if self.desired.is_empty() {
            return None;
        }
        let channels: Vec<String> = self.desired.iter().cloned().collect();
        Some((Self::request(&channels), channels))
    }

    fn request(channels: &[String]) -> JsonRpcRequest {
        JsonRpcRequest::for_kind(RequestKind::Subscribe, json!({ "channels": channels }))
    }

    /// Apply the server's answer to a subscribe request.
    ///
    /// On success returns the channels the server confirmed: its `result`
    /// array when present, otherwise the channels that were requested.
    pub fn on_ack(&mut self, requested: Vec<String>, result: Result<Value>) -> Result<Vec<String>> {
        let value = result?;
        let confirmed = match value.as_array() {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => requested,
        };

        for channel in &confirmed {
            if !self.desired.contains(channel) {
                debug!("Server confirmed undesired channel {}", channel);
            }
            self.confirmed.insert(channel.clone());
        }
        Ok(confirmed)
    }

    /// Forget confirmations; the connection they belonged to is gone.
    pub fn reset_confirmed(&mut self) {
        self.confirmed.clear();
    }

    pub fn desired(&self) -> &BTreeSet<String> {
        &self.desired
    }

    pub fn confirmed(&self) -> &BTreeSet<String> {
        &self.confirmed
    }

    pub fn is_confirmed(&self, channel: &str) -> bool {
        self.confirmed.contains(channel)
    }
}
