//! Error taxonomy for the worker runtime
//!
//! Failures are classified the way the dispatcher and the broker link need to
//! react to them: parse errors end a message, transport errors surface to the
//! caller, connection failures feed the reconnect loop and a protocol mismatch
//! stops the process.

use crate::broker::ConnectionState;
use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for worker runtime operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Could not parse message: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("No connection or incompatible protocol: {0}")]
    ProtocolIncompatible(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification failed for {} destination(s), {sent} sent", failures.len())]
    Notify {
        sent: usize,
        failures: Vec<NotifyFailure>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// One destination that could not be notified
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyFailure {
    pub topic: String,
    pub error: String,
}

impl WorkerError {
    /// Create a parse error
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }

    /// Whether the broker link should stop retrying after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::ProtocolIncompatible(_) => true,
            WorkerError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for worker runtime operations
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_constructor() {
        let error = WorkerError::parse("expected value at line 1 column 1");
        assert!(matches!(error, WorkerError::Parse(_)));
        assert_eq!(
            error.to_string(),
            "Could not parse message: expected value at line 1 column 1"
        );
    }

    #[test]
    fn test_not_connected_display_includes_state() {
        let error = WorkerError::NotConnected {
            state: ConnectionState::Closed,
        };
        assert_eq!(error.to_string(), "Not connected - current state: Closed");
    }

    #[test]
    fn test_notify_display_counts_failures() {
        let error = WorkerError::Notify {
            sent: 1,
            failures: vec![
                NotifyFailure {
                    topic: "notify.irc".to_string(),
                    error: "boom".to_string(),
                },
                NotifyFailure {
                    topic: "notify.email".to_string(),
                    error: "boom".to_string(),
                },
            ],
        };
        assert_eq!(
            error.to_string(),
            "Notification failed for 2 destination(s), 1 sent"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(WorkerError::ProtocolIncompatible("0-9-1".to_string()).is_fatal());
        assert!(
            WorkerError::Transport(TransportError::ProtocolIncompatible("x".to_string()))
                .is_fatal()
        );
        assert!(!WorkerError::Connection("refused".to_string()).is_fatal());
        assert!(
            !WorkerError::Transport(TransportError::ConnectionFailed("refused".into())).is_fatal()
        );
        assert!(!WorkerError::parse("bad").is_fatal());
    }
}
