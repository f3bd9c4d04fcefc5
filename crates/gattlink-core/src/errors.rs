//! Error types for the gattlink session layer
//!
//! Precondition violations (`AlreadyScanning`, `InvalidState`,
//! `UnsupportedOperation`, `PayloadTooLarge`) are returned synchronously to the
//! caller. Asynchronous native failures travel as session events and only use
//! `NativeOperationFailed` when a native call is rejected outright.

use uuid::Uuid;

use crate::types::DeviceId;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Core error type shared by every gattlink crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Characteristic {characteristic} does not support {operation}")]
    UnsupportedOperation {
        operation: &'static str,
        characteristic: Uuid,
    },

    #[error("Advertisement payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Connection timed out")]
    ConnectionTimedOut,

    #[error("Native {operation} failed: {reason}")]
    NativeOperationFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: DeviceId },

    #[error("Service {service} not found on device {device}")]
    ServiceNotFound { device: DeviceId, service: Uuid },

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("A {operation} is already in flight for device {device}")]
    OperationInProgress {
        operation: &'static str,
        device: DeviceId,
    },

    #[error("Invalid UUID: {input}")]
    InvalidUuid { input: String },

    #[error("Invalid device address: {input}")]
    InvalidAddress { input: String },

    #[error("Advertisement field {index} is {actual} bytes, layout declares {expected}")]
    FieldLengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Advertisement has {actual} fields, layout declares {expected}")]
    FieldCountMismatch { expected: usize, actual: usize },

    #[error("Session closed")]
    SessionClosed,
}

impl GattError {
    /// Whether this error is a caller precondition violation rather than a
    /// native or session failure
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            GattError::AlreadyScanning
                | GattError::InvalidState { .. }
                | GattError::UnsupportedOperation { .. }
                | GattError::PayloadTooLarge { .. }
                | GattError::OperationInProgress { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, GattError>;
