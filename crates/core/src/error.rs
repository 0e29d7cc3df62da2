//! Error types for stationlink-core

use thiserror::Error;

/// Socket-level failure while opening the channel transport.
///
/// Transient: retried by the supervisor's backoff and persistent retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Socket connection timeout after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Join handshake did not complete.
///
/// Surfaced to the caller of the top-level connect request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Channel join failed: {0}")]
    Rejected(String),

    #[error("Channel join timeout after {0}ms")]
    Timeout(u64),
}

/// Device-level print failure, reported through the ack only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrintError {
    #[error("Printer not ready")]
    NotReady,

    #[error("{0}")]
    Failed(String),
}

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Channel not joined")]
    NotJoined,

    #[error("Authentication required before connecting")]
    MissingCredentials,
}

impl CoreError {
    /// Whether the supervisor should keep retrying after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Connect(_) | CoreError::Io(_) | CoreError::NotJoined)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<tokio_tungstenite::tungstenite::Error> for ConnectError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotJoined;
        assert_eq!(err.to_string(), "Channel not joined");
    }

    #[test]
    fn test_print_not_ready_message() {
        // The ack carries this text verbatim
        assert_eq!(PrintError::NotReady.to_string(), "Printer not ready");
        assert_eq!(PrintError::Failed("paper jam".into()).to_string(), "paper jam");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::from(ConnectError::Timeout(10_000)).is_transient());
        assert!(CoreError::from(ConnectError::Transport("Socket closed during join".into())).is_transient());
        assert!(CoreError::NotJoined.is_transient());
        assert!(!CoreError::from(JoinError::Timeout(5_000)).is_transient());
        assert!(!CoreError::from(JoinError::Rejected("unauthorized".into())).is_transient());
        assert!(!CoreError::MissingCredentials.is_transient());
    }

    #[test]
    fn test_transparent_display() {
        let err = CoreError::from(ConnectError::Timeout(10_000));
        assert_eq!(err.to_string(), "Socket connection timeout after 10000ms");
    }
}
