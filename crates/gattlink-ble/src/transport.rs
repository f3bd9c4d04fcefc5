//! Abstract native BLE transports
//!
//! Sessions never talk to a platform stack directly. A transport issues native
//! requests and reports their outcome later through the [`EventSink`] the
//! session attaches, mirroring how Android and CoreBluetooth deliver results
//! through callbacks. Transport methods must return promptly: long-running
//! work (connecting, discovery, reads) completes through events.

use std::fmt;

use async_trait::async_trait;
use gattlink_core::{
    AdvertiseConfig, AdvertisementData, DeviceId, ManagerState, Service, WriteMode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportResult;

// ----------------------------------------------------------------------------
// Shared Types
// ----------------------------------------------------------------------------

/// Address of a characteristic on a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(device: DeviceId, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            device,
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.service, self.characteristic)
    }
}

/// Callback channel from a native stack into a session task
#[derive(Debug)]
pub struct EventSink<E> {
    sender: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E> EventSink<E> {
    pub fn new(sender: mpsc::UnboundedSender<E>) -> Self {
        Self { sender }
    }

    /// Deliver an event; returns `false` once the session has gone away
    pub fn send(&self, event: E) -> bool {
        self.sender.send(event).is_ok()
    }
}

pub type TransportEventSink = EventSink<TransportEvent>;
pub type PeripheralEventSink = EventSink<PeripheralTransportEvent>;

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// What a central transport needs from the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Enabling notifications requires an explicit CCCD write after the
    /// native notification request (Android). Stacks that write the
    /// descriptor themselves (CoreBluetooth, btleplug) report the outcome via
    /// [`TransportEvent::NotificationStateUpdated`] instead.
    pub cccd_write_required: bool,
}

/// Native callback delivered to a central session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ManagerStateChanged(ManagerState),
    DeviceDiscovered {
        device: DeviceId,
        rssi: i16,
        advertisement: AdvertisementData,
    },
    ScanFailed {
        reason: String,
    },
    DeviceConnected {
        device: DeviceId,
    },
    ConnectionFailed {
        device: DeviceId,
        reason: String,
    },
    /// Link went down, solicited or not
    DeviceDisconnected {
        device: DeviceId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        device: DeviceId,
        services: Vec<Service>,
    },
    ServiceDiscoveryFailed {
        device: DeviceId,
        reason: String,
    },
    CharacteristicRead {
        target: CharacteristicRef,
        result: Result<Vec<u8>, String>,
    },
    CharacteristicNotified {
        target: CharacteristicRef,
        value: Vec<u8>,
    },
    /// Only reported for writes issued with [`WriteMode::WithResponse`]
    CharacteristicWritten {
        target: CharacteristicRef,
        result: Result<(), String>,
    },
    DescriptorWritten {
        target: CharacteristicRef,
        descriptor: Uuid,
        result: Result<(), String>,
    },
    NotificationStateUpdated {
        target: CharacteristicRef,
        enabled: bool,
        result: Result<(), String>,
    },
    RssiRead {
        device: DeviceId,
        result: Result<i16, String>,
    },
}

/// Native central stack (Android `BluetoothGatt`, CoreBluetooth, BlueZ...)
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Route native callbacks into a session
    fn attach(&self, sink: TransportEventSink);

    fn capabilities(&self) -> TransportCapabilities;

    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> TransportResult<()>;

    async fn stop_scan(&self) -> TransportResult<()>;

    async fn connect(&self, device: DeviceId) -> TransportResult<()>;

    /// Abandon a pending connect attempt
    async fn cancel_connect(&self, device: DeviceId) -> TransportResult<()>;

    async fn disconnect(&self, device: DeviceId) -> TransportResult<()>;

    async fn discover_services(&self, device: DeviceId) -> TransportResult<()>;

    async fn read(&self, target: CharacteristicRef) -> TransportResult<()>;

    /// `mode` is already resolved, never [`WriteMode::Auto`]
    async fn write(&self, target: CharacteristicRef, data: &[u8], mode: WriteMode)
        -> TransportResult<()>;

    async fn set_notify(&self, target: CharacteristicRef, enable: bool) -> TransportResult<()>;

    async fn write_descriptor(
        &self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()>;

    async fn read_rssi(&self, device: DeviceId) -> TransportResult<()>;
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Why a native advertiser refused to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertiseFailure {
    Unsupported,
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
}

impl fmt::Display for AdvertiseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AdvertiseFailure::Unsupported => "advertising is not supported",
            AdvertiseFailure::DataTooLarge => "advertisement data too large",
            AdvertiseFailure::TooManyAdvertisers => "no advertising instance available",
            AdvertiseFailure::AlreadyStarted => "advertising already started",
            AdvertiseFailure::InternalError => "internal advertiser error",
        };
        f.write_str(reason)
    }
}

/// Peripheral features the local controller offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdvertisingSupport {
    pub multiple_advertisement: bool,
    pub offloaded_batching: bool,
    pub offloaded_filtering: bool,
}

impl AdvertisingSupport {
    pub fn full() -> Self {
        Self {
            multiple_advertisement: true,
            offloaded_batching: true,
            offloaded_filtering: true,
        }
    }

    /// Advertising works but some offload features are missing
    pub fn is_degraded(&self) -> bool {
        self.multiple_advertisement && !(self.offloaded_batching && self.offloaded_filtering)
    }

    pub fn can_advertise(&self) -> bool {
        self.multiple_advertisement
    }
}

/// Native identifier of a remote ATT request awaiting a response
pub type RequestId = u64;

/// ATT status returned to a remote central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttStatus {
    Success,
    InvalidOffset,
    AttributeNotFound,
    ReadNotPermitted,
    WriteNotPermitted,
}

/// Native callback delivered to a peripheral session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralTransportEvent {
    StateChanged(ManagerState),
    ServiceAdded {
        service: Uuid,
        result: Result<(), String>,
    },
    AdvertiseStarted(Result<(), AdvertiseFailure>),
    ReadRequest {
        request: RequestId,
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
    },
    WriteRequest {
        request: RequestId,
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        offset: usize,
        value: Vec<u8>,
        response_needed: bool,
    },
    Subscribed {
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    Unsubscribed {
        central: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
}

/// Native peripheral manager (Android `BluetoothGattServer` + advertiser,
/// `CBPeripheralManager`, BlueZ GATT application...)
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    fn attach(&self, sink: PeripheralEventSink);

    /// Current radio state
    fn state(&self) -> ManagerState;

    fn advertising_support(&self) -> AdvertisingSupport;

    async fn add_service(&self, service: &Service) -> TransportResult<()>;

    async fn remove_service(&self, service: Uuid) -> TransportResult<()>;

    /// Begin advertising; the outcome arrives as
    /// [`PeripheralTransportEvent::AdvertiseStarted`]
    async fn start_advertising(&self, config: &AdvertiseConfig) -> TransportResult<()>;

    async fn stop_advertising(&self) -> TransportResult<()>;

    async fn respond(
        &self,
        request: RequestId,
        status: AttStatus,
        value: Option<&[u8]>,
    ) -> TransportResult<()>;

    async fn notify_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        centrals: &[DeviceId],
    ) -> TransportResult<()>;
}
