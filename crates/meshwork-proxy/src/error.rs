//! Forwarding error types

use thiserror::Error;

/// Forwarding layer errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Overlay dial/listen failure
    #[error("overlay error: {0}")]
    Overlay(#[from] meshwork_overlay::OverlayError),

    /// Dial to the relay target timed out
    #[error("dial timed out")]
    DialTimeout,

    /// A forwarding task did not complete cleanly
    #[error("forwarding task failed: {0}")]
    TaskFailed(String),
}

/// Result type for forwarding operations
pub type ProxyResult<T> = Result<T, ProxyError>;
