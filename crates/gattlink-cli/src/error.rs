//! Error handling for the gattlink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("GATT error: {0}")]
    Gatt(#[from] gattlink_core::GattError),

    #[error("Transport error: {0}")]
    Transport(#[from] gattlink_ble::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device {0} was not seen while scanning")]
    DeviceNotSeen(String),

    #[error("{0}")]
    OperationFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Config(err.to_string())
    }
}
