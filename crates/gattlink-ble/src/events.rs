//! Outward session events
//!
//! Delivered on the broadcast feed returned by `GattSession::events()` and
//! `PeripheralSession::events()`. Device payloads are snapshots taken when the
//! event was emitted.

use gattlink_core::{AdvertiseConfig, Device, DeviceId, ManagerState, Service};
use uuid::Uuid;

use crate::transport::{AdvertiseFailure, AttStatus};

// ----------------------------------------------------------------------------
// Central Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ManagerStateChanged(ManagerState),
    /// New sighting or refresh of a known device during a scan
    DeviceDiscovered(Device),
    /// Scan pass ended by its timeout, with every device seen during the pass
    ScanTimedOut(Vec<Device>),
    ScanFailed {
        reason: String,
    },
    DeviceConnected(Device),
    DeviceDisconnected(Device),
    DeviceFailedToConnect {
        device: Device,
        reason: String,
    },
    ServicesDiscovered {
        device: DeviceId,
        services: Vec<Service>,
    },
    ServiceDiscoveryFailed {
        device: DeviceId,
        reason: String,
    },
    CharacteristicValueUpdated {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicReadFailed {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        reason: String,
    },
    WriteComplete {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        success: bool,
        error: Option<String>,
    },
    NotificationStateChanged {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        updating: bool,
        error: Option<String>,
    },
    RssiUpdated {
        device: DeviceId,
        rssi: i16,
    },
}

impl SessionEvent {
    /// Device the event concerns, if any
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            SessionEvent::ManagerStateChanged(_)
            | SessionEvent::ScanTimedOut(_)
            | SessionEvent::ScanFailed { .. } => None,
            SessionEvent::DeviceDiscovered(device)
            | SessionEvent::DeviceConnected(device)
            | SessionEvent::DeviceDisconnected(device)
            | SessionEvent::DeviceFailedToConnect { device, .. } => Some(device.id),
            SessionEvent::ServicesDiscovered { device, .. }
            | SessionEvent::ServiceDiscoveryFailed { device, .. }
            | SessionEvent::CharacteristicValueUpdated { device, .. }
            | SessionEvent::CharacteristicReadFailed { device, .. }
            | SessionEvent::WriteComplete { device, .. }
            | SessionEvent::NotificationStateChanged { device, .. }
            | SessionEvent::RssiUpdated { device, .. } => Some(*device),
        }
    }
}

// ----------------------------------------------------------------------------
// Peripheral Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    ManagerStateChanged(ManagerState),
    ServiceAdded {
        service: Uuid,
        error: Option<String>,
    },
    AdvertiseStartSuccess(AdvertiseConfig),
    AdvertiseStartFailed(AdvertiseFailure),
    ReadRequestServed {
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        status: AttStatus,
    },
    WriteRequestReceived {
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        status: AttStatus,
    },
    CentralSubscribed {
        central: DeviceId,
        characteristic: Uuid,
    },
    CentralUnsubscribed {
        central: DeviceId,
        characteristic: Uuid,
    },
}
