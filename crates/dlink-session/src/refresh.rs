//! Refresh scheduler.
//!
//! Decides when the controller should send a `refresh_token` grant. Two wake
//! policies are supported:
//!
//! - [`RefreshPolicy::Deadline`] wakes exactly at the token expiry instant.
//! - [`RefreshPolicy::Poll`] wakes on a fixed period and refreshes only if
//!   the expiry has passed. A token shorter than the period can lapse
//!   between polls.
//!
//! Either way at most one refresh is in flight. A refresh with no answer
//! after `timeout` is abandoned so a later wake-up may try again, and a
//! failed refresh is retried no sooner than `timeout` later. Two refreshes
//! are never sent less than [`MIN_REFRESH_INTERVAL`] apart, however short
//! the token.

use std::time::Duration;

use tokio::time::Instant;

use dlink_core::prelude::*;

/// Period of the classic polling scheduler.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(150);

/// Floor between an authentication or refresh and the next refresh.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// When the scheduler wakes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Wake at the token expiry instant.
    #[default]
    Deadline,
    /// Wake every `period`, refresh if the token has expired.
    Poll { period: Duration },
}

/// Outcome of one wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Send a refresh now; the scheduler is marked in flight.
    Refresh,
    /// A refresh is already outstanding.
    InFlight,
    /// Token still valid, or a retry delay is running.
    NotDue,
}

#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    policy: RefreshPolicy,
    timeout: Duration,
    in_flight_since: Option<Instant>,
    next_poll: Option<Instant>,
    not_before: Option<Instant>,
}

impl RefreshScheduler {
    pub fn new(policy: RefreshPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            in_flight_since: None,
            next_poll: None,
            not_before: None,
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    /// Begin scheduling for a freshly authenticated connection.
    pub fn start(&mut self, now: Instant) {
        if let RefreshPolicy::Poll { period } = self.policy {
            self.next_poll = Some(now + period);
        }
        self.not_before = Some(now + MIN_REFRESH_INTERVAL);
    }

    /// The instant the controller should next call [`Self::on_wake`], or
    /// `None` when nothing is scheduled.
    pub fn next_wake(&self, expiry: Option<Instant>) -> Option<Instant> {
        if let Some(since) = self.in_flight_since {
            return Some(since + self.timeout);
        }
        let due = match self.policy {
            RefreshPolicy::Deadline => expiry,
            RefreshPolicy::Poll { .. } => self.next_poll,
        }?;
        Some(match self.not_before {
            Some(not_before) => due.max(not_before),
            None => due,
        })
    }

    /// Evaluate a wake-up against the current token expiry.
    ///
    /// The in-flight check and the set happen in this one call, so two
    /// wake-ups can never both get [`RefreshDecision::Refresh`].
    pub fn on_wake(&mut self, now: Instant, expiry: Instant) -> RefreshDecision {
        if let RefreshPolicy::Poll { period } = self.policy {
            self.next_poll = Some(now + period);
        }

        if let Some(since) = self.in_flight_since {
            if now.saturating_duration_since(since) < self.timeout {
                return RefreshDecision::InFlight;
            }
            warn!(
                "Token refresh unanswered after {:?}, allowing a retry",
                self.timeout
            );
            self.in_flight_since = None;
            self.not_before = None;
        }

        if self.not_before.is_some_and(|t| now < t) || now < expiry {
            return RefreshDecision::NotDue;
        }

        self.in_flight_since = Some(now);
        RefreshDecision::Refresh
    }

    /// The outstanding refresh succeeded.
    pub fn complete(&mut self, now: Instant) {
        self.in_flight_since = None;
        self.not_before = Some(now + MIN_REFRESH_INTERVAL);
    }

    /// The outstanding refresh was rejected; hold off for one timeout.
    pub fn fail(&mut self, now: Instant) {
        self.in_flight_since = None;
        self.not_before = Some(now + self.timeout);
    }

    /// Stop all scheduling (shutdown or connection replaced).
    pub fn reset(&mut self) {
        self.in_flight_since = None;
        self.next_poll = None;
        self.not_before = None;
    }
}
