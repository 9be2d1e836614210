use std::time::Duration;
use thiserror::Error;

/// Result type for Mu operations
pub type Result<T> = std::result::Result<T, MuError>;

/// Errors that can occur in Mu operations
#[derive(Error, Debug)]
pub enum MuError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Failed to connect to {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No active channel available for {0}")]
    NoActiveChannel(String),

    #[error("Channel is not active for {0}")]
    ChannelInactive(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection manager is closing")]
    ManagerClosing,

    #[error("Transport has been shut down")]
    Shutdown,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<prost::DecodeError> for MuError {
    fn from(e: prost::DecodeError) -> Self {
        MuError::Protocol(format!("Undecodable envelope body: {}", e))
    }
}

impl From<prost::EncodeError> for MuError {
    fn from(e: prost::EncodeError) -> Self {
        MuError::Protocol(format!("Failed to encode envelope body: {}", e))
    }
}
