//! Error types shared across the daemon.

use thiserror::Error;

/// Top-level error type for authguard operations.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("event source error: {0}")]
    EventSource(String),

    #[error("firewall command failed: {0}")]
    Firewall(String),

    #[error("audit store error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
