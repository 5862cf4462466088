use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Authentication failed for {target}: {reason}")]
    Authentication { target: String, reason: String },

    #[error("Host {target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("SSH negotiation with {target} failed: {reason}")]
    Negotiation { target: String, reason: String },

    #[error("Host key mismatch for {target}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("Connection to {0} is not open")]
    NotConnected(String),

    #[error("SSH session to {target} was lost: {reason}")]
    SessionLost { target: String, reason: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Local path not found: {0}")]
    LocalNotFound(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Only network-level, handshake and lost-session failures are
    /// transient; credential and host-key problems will fail the same way on
    /// every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::Unreachable { .. }
                | RunnerError::Negotiation { .. }
                | RunnerError::SessionLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
