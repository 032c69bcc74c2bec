//! Signaling error types

use thiserror::Error;

/// Signaling layer errors
#[derive(Debug, Error)]
pub enum SignalError {
    /// HTTP transport error
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Relay answered with an unexpected status
    #[error("relay returned status {0}")]
    RelayStatus(u16),

    /// Message could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The relay URL is not usable
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),
}

/// Result type for signaling operations
pub type SignalResult<T> = Result<T, SignalError>;
