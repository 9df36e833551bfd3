//! Connection state machine vocabulary.
//!
//! The orchestrator in `sfinx-voice` is the only writer of
//! [`ConnectionState`]; everything else observes it through a watch channel
//! or the broadcast of [`StateTransition`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The auth token or room-access token was rejected or expired.
    Auth,
    /// The interview does not correspond to an active session.
    NotFound,
    /// Transport or connectivity failure.
    Network,
    /// Microphone permission denied or device unavailable.
    Media,
    /// The backend answered with an unexpected status or body.
    Backend,
    /// The client is missing configuration needed to connect.
    Config,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Auth => "authentication",
            Self::NotFound => "not found",
            Self::Network => "network",
            Self::Media => "media",
            Self::Backend => "backend",
            Self::Config => "configuration",
        }
    }
}

/// State of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    RequestingToken,
    Connecting,
    /// Microphone capture is live and remote audio is being rendered.
    Connected,
    /// Terminal for the attempt; a new `connect` restarts from `Idle`.
    Failed { kind: FailureKind, message: String },
    Disconnected,
}

impl ConnectionState {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Short machine-friendly label, used as a structured log field.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingToken => "requesting_token",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed { .. } => "failed",
            Self::Disconnected => "disconnected",
        }
    }

    /// True while an attempt is between its first step and a settled outcome.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::RequestingToken | Self::Connecting)
    }

    /// True for states from which a fresh attempt may start.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed { .. } | Self::Disconnected)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Human-readable status line shown to the operator.
    pub fn status_message(&self) -> String {
        match self {
            Self::Idle => "Ready to connect".to_string(),
            Self::RequestingToken => "Requesting room access token...".to_string(),
            Self::Connecting => "Connecting to interview room...".to_string(),
            Self::Connected => {
                "Connected. Microphone is live, speak to the interviewer".to_string()
            }
            Self::Failed { kind, message } => {
                format!("Connection failed ({} error): {}", kind.label(), message)
            }
            Self::Disconnected => "Disconnected".to_string(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_message())
    }
}

/// Emitted to subscribers on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_is_the_initial_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn settled_and_in_flight_are_disjoint() {
        let all = [
            ConnectionState::Idle,
            ConnectionState::RequestingToken,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::failed(FailureKind::Auth, "expired"),
            ConnectionState::Disconnected,
        ];
        for state in &all {
            assert!(
                !(state.is_settled() && state.is_in_flight()),
                "{state:?} cannot be both settled and in flight"
            );
        }
        assert!(!ConnectionState::Connected.is_settled());
        assert!(!ConnectionState::Connected.is_in_flight());
    }

    #[test]
    fn failed_status_message_names_the_cause() {
        let state = ConnectionState::failed(FailureKind::Media, "microphone permission denied");
        let msg = state.status_message();
        assert!(msg.contains("media"));
        assert!(msg.contains("microphone permission denied"));
        assert_eq!(state.failure_kind(), Some(FailureKind::Media));
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(ConnectionState::failed(FailureKind::NotFound, "gone"))
            .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["message"], "gone");
    }
}
