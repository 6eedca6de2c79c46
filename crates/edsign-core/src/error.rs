//! Error types for edsign operations

use thiserror::Error;

/// Result type alias for edsign operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the edsign protocols
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid group configuration: bad threshold, missing self, duplicates
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed or unverifiable protocol packet; session-scoped
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Fewer than `t` live or honest participants at termination
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Fewer than `t` valid partial signatures after everyone answered
    #[error("Not enough partial signatures: required {required}, got {actual}")]
    NotEnoughPartials { required: usize, actual: usize },

    /// Dial, send or receive failure; non-fatal per packet
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence failure after a share was emitted
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Proposal or signature info rejected by the validator hook
    #[error("Validation rejected: {0}")]
    Rejected(String),

    /// Invariant violation or cryptographic library misuse
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
