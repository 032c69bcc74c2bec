//! Overlay error types

use thiserror::Error;

/// Overlay layer errors
#[derive(Debug, Error)]
pub enum OverlayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Configuration text could not be parsed or applied
    #[error("configuration error: {0}")]
    Config(String),

    /// WireGuard protocol error
    #[error("WireGuard error: {0}")]
    WireGuard(String),

    /// Overlay dial/listen failure
    #[error("overlay net error: {0}")]
    Net(String),

    /// The device is not initialized
    #[error("overlay device not initialized")]
    NotInitialized,

    /// Platform not supported
    #[error("platform not supported for this operation")]
    PlatformNotSupported,
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;
