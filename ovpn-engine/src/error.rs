//! Error types for the VPN engine

use thiserror::Error;

/// Result type alias for VPN operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during VPN operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ovpn_protocol::Error),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Session stopped for a reason retrying will not fix
    #[error("session stopped: {0}")]
    Stopped(String),

    /// Already running
    #[error("VPN is already running")]
    AlreadyRunning,

    /// Not running
    #[error("VPN is not running")]
    NotRunning,

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Connection(_) | Error::Io(_) => true,
            Error::Protocol(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
