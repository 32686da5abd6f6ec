//! Error types for the tunnel data plane.

use thiserror::Error;

/// Errors surfaced by the engine and its components.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Bad or missing user input (empty key, empty proxy, malformed CIDR, ...).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// OS-level device or routing failure.
    #[error("TUN device error: {0}")]
    Device(String),

    /// Network stack wiring failure.
    #[error("Stack error: {0}")]
    Stack(String),

    /// Dial or relay failure of a single connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;
