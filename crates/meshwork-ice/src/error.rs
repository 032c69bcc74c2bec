//! Negotiation error types

use thiserror::Error;

/// Negotiation layer errors
#[derive(Debug, Error)]
pub enum IceError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signaling failure
    #[error("signaling error: {0}")]
    Signal(#[from] meshwork_signal::SignalError),

    /// STUN exchange failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// A peer sent something we could not make sense of
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Candidate text could not be parsed
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// No usable candidates were gathered or received
    #[error("no usable candidates")]
    NoCandidates,

    /// Connectivity checks did not reach consensus in time
    #[error("connectivity checks timed out")]
    CheckTimeout,

    /// The session was cancelled; not a failure
    #[error("session cancelled")]
    Cancelled,

    /// The signaling channel closed before the expected message arrived
    #[error("signaling channel closed")]
    ChannelClosed,
}

impl IceError {
    /// Cancellation is an expected teardown path, never worth an error log.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, IceError::Cancelled)
    }
}

/// Result type for negotiation operations
pub type IceResult<T> = Result<T, IceError>;
