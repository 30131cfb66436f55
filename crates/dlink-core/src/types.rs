//! Core domain types

use serde::{Deserialize, Serialize};

/// Lifecycle state of the single exchange session.
///
/// ```text
/// Disconnected ─▶ Connecting ─▶ Connected ─▶ Authenticating ─▶ Authenticated ⟲ (refresh)
///                     │             │                               │
///                     └────────▶ Failed ◀───────────────────────────┘
/// any ─▶ Closing ─▶ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Closing,
    Failed,
}

impl SessionState {
    /// Whether the session has stopped for good and needs a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed)
    }

    /// Check whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            // Shutdown is allowed from anywhere.
            (_, Closing) => true,
            (Closing, Disconnected) => true,
            (Disconnected, Connecting) => true,
            // A reconnect attempt starts over from a failed transport.
            (Failed, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Authenticating) => true,
            (Authenticating, Authenticated) => true,
            (Authenticated, Authenticated) => true,
            (Connected, Failed) | (Authenticating, Failed) | (Authenticated, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        let path = [
            Disconnected,
            Connecting,
            Connected,
            Authenticating,
            Authenticated,
            Authenticated,
            Closing,
            Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionState::*;
        assert!(!Disconnected.can_transition_to(Authenticated));
        assert!(!Connecting.can_transition_to(Authenticating));
        assert!(!Failed.can_transition_to(Authenticated));
        assert!(!Closing.can_transition_to(Connected));
    }

    #[test]
    fn test_only_failed_is_terminal() {
        assert!(!SessionState::Authenticated.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Authenticating).unwrap();
        assert_eq!(json, "\"authenticating\"");
    }
}
