//! Error types for native BLE transports

use gattlink_core::{DeviceId, GattError};
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures reported by a native transport call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to start scan: {0}")]
    ScanFailed(String),

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),

    #[error("Unknown device: {device}")]
    UnknownDevice { device: DeviceId },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: Uuid },

    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    #[error("Failed to write characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to change notification state: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write descriptor: {0}")]
    DescriptorWriteFailed(String),

    #[error("Failed to read RSSI: {0}")]
    RssiFailed(String),

    #[error("Advertising failed: {0}")]
    AdvertisingFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl TransportError {
    /// Name of the native operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            TransportError::AdapterNotAvailable => "adapter",
            TransportError::ScanFailed(_) => "scan",
            TransportError::ConnectionFailed(_) => "connect",
            TransportError::DisconnectFailed(_) => "disconnect",
            TransportError::UnknownDevice { .. } => "device lookup",
            TransportError::ServiceDiscoveryFailed(_) => "service discovery",
            TransportError::CharacteristicNotFound { .. } => "characteristic lookup",
            TransportError::ReadFailed(_) => "read",
            TransportError::WriteFailed(_) => "write",
            TransportError::SubscriptionFailed(_) => "subscribe",
            TransportError::DescriptorWriteFailed(_) => "descriptor write",
            TransportError::RssiFailed(_) => "rssi",
            TransportError::AdvertisingFailed(_) => "advertise",
            TransportError::EventStreamFailed(_) => "event stream",
            TransportError::Unsupported(operation) => operation,
            TransportError::Platform(_) => "platform",
        }
    }
}

impl From<TransportError> for GattError {
    fn from(err: TransportError) -> Self {
        GattError::NativeOperationFailed {
            operation: err.operation(),
            reason: err.to_string(),
        }
    }
}

pub type TransportResult<T> = core::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_into_native_operation_failed() {
        let err: GattError = TransportError::WriteFailed("gatt busy".into()).into();
        assert_eq!(
            err,
            GattError::NativeOperationFailed {
                operation: "write",
                reason: "Failed to write characteristic: gatt busy".to_string(),
            }
        );
        assert!(!err.is_precondition());
    }
}
