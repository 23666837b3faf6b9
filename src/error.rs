//! Error types for the support-routing core

use thiserror::Error;

use crate::items::SessionId;

/// Result type alias for the support-routing core
pub type Result<T> = std::result::Result<T, HelplineError>;

/// Main error type for the support-routing core
#[derive(Debug, Error)]
pub enum HelplineError {
    /// The session id does not exist in the registry
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session has been closed; no further messages are accepted
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    /// Illegal ownership change (includes no-op transfers)
    #[error("invalid transition: {message}")]
    InvalidTransition { message: String },

    /// The identity's transport has disconnected since assignment
    #[error("not connected: {identity}")]
    NotConnected { identity: String },

    /// The inference call failed (timeout, malformed output)
    #[error("inference error: {message}")]
    Inference { message: String },

    /// Tool execution error
    #[error("tool error: {message}")]
    Tool { message: String },

    /// No human operator is free to take an escalation. Expected,
    /// recoverable business outcome rather than a system fault.
    #[error("no operator available for session {0}")]
    NoOperatorAvailable(SessionId),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl HelplineError {
    /// Convenience constructor for invalid ownership transitions.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    /// Convenience constructor for stale transport mappings.
    pub fn not_connected(identity: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            identity: identity.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HelplineError::UnknownSession(SessionId::from("s-42"));
        assert_eq!(err.to_string(), "unknown session: s-42");

        let err = HelplineError::invalid_transition("owner unchanged");
        assert_eq!(err.to_string(), "invalid transition: owner unchanged");

        let err = HelplineError::NoOperatorAvailable(SessionId::from("s-1"));
        assert_eq!(err.to_string(), "no operator available for session s-1");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: HelplineError = serde_err.into();
        assert!(matches!(err, HelplineError::Serialization(_)));
    }

    #[test]
    fn test_result_type() {
        fn might_fail(ok: bool) -> Result<&'static str> {
            if ok {
                Ok("fine")
            } else {
                Err(HelplineError::not_connected("operator-7"))
            }
        }

        assert!(might_fail(true).is_ok());
        let err = might_fail(false).unwrap_err();
        assert!(matches!(err, HelplineError::NotConnected { .. }));
        assert_eq!(err.to_string(), "not connected: operator-7");
    }
}
