//! Error types for the split-relay proxy.

use thiserror::Error;

/// Result type alias for split-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid SOCKS5 protocol data.
    #[error("Invalid SOCKS5 protocol: {0}")]
    InvalidSocks5Protocol(String),

    /// Unsupported proxy command.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    /// Unsupported address type.
    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    /// Outbound connect to the requested endpoint failed.
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
