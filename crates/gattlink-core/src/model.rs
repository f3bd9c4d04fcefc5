//! GATT entity model
//!
//! Plain data describing remote devices and their attribute tables as seen by
//! the session layer. Sessions own these values; callers only ever receive
//! clones.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{GattError, Result};
use crate::flags::{CharacteristicPermissions, CharacteristicProperties};
use crate::types::{DeviceId, CLIENT_CHARACTERISTIC_CONFIGURATION};

// ----------------------------------------------------------------------------
// States
// ----------------------------------------------------------------------------

/// Connection state of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl DeviceState {
    /// Devices with a live or pending link are never evicted
    pub fn is_linked(&self) -> bool {
        matches!(self, DeviceState::Connecting | DeviceState::Connected)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Radio state reported by the native manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ManagerState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
    /// Radio is on but some peripheral features are missing
    PartialSupport,
}

impl ManagerState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, ManagerState::PoweredOn | ManagerState::PartialSupport)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Unknown => "unknown",
            ManagerState::Resetting => "resetting",
            ManagerState::Unsupported => "unsupported",
            ManagerState::Unauthorized => "unauthorized",
            ManagerState::PoweredOff => "powered off",
            ManagerState::PoweredOn => "powered on",
            ManagerState::PartialSupport => "partially supported",
        };
        f.write_str(name)
    }
}

/// How a characteristic write is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
    /// Pick whichever write the characteristic supports, preferring a
    /// confirmed write when both are available
    #[default]
    Auto,
}

// ----------------------------------------------------------------------------
// Attribute Table
// ----------------------------------------------------------------------------

/// GATT descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub value: Option<Vec<u8>>,
}

impl Descriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, value: None }
    }
}

/// GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    /// Service this characteristic belongs to
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: CharacteristicPermissions,
    /// Last known value, `None` until read or notified
    pub value: Option<Vec<u8>>,
    /// Whether notifications or indications are enabled
    pub updating: bool,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, service_uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            service_uuid,
            properties,
            permissions: CharacteristicPermissions::empty(),
            value: None,
            updating: false,
            descriptors: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: CharacteristicPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn can_read(&self) -> bool {
        self.properties.contains(CharacteristicProperties::READ)
    }

    pub fn can_write(&self) -> bool {
        self.properties.can_write()
    }

    pub fn can_update(&self) -> bool {
        self.properties.can_update()
    }

    /// Value decoded as UTF-8, lossy; empty when no value is known
    pub fn string_value(&self) -> String {
        self.value
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }

    pub fn has_cccd(&self) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION)
    }

    pub fn require_read(&self) -> Result<()> {
        if self.can_read() {
            Ok(())
        } else {
            Err(self.unsupported("read"))
        }
    }

    pub fn require_update(&self) -> Result<()> {
        if self.can_update() {
            Ok(())
        } else {
            Err(self.unsupported("notify"))
        }
    }

    /// Resolve the requested write mode against the declared properties
    pub fn resolve_write_mode(&self, mode: WriteMode) -> Result<WriteMode> {
        let with_response = self.properties.contains(CharacteristicProperties::WRITE);
        let without_response = self
            .properties
            .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE);

        match mode {
            WriteMode::WithResponse if with_response => Ok(WriteMode::WithResponse),
            WriteMode::WithoutResponse if without_response => Ok(WriteMode::WithoutResponse),
            WriteMode::Auto if with_response => Ok(WriteMode::WithResponse),
            WriteMode::Auto if without_response => Ok(WriteMode::WithoutResponse),
            WriteMode::WithoutResponse => Err(self.unsupported("write without response")),
            _ => Err(self.unsupported("write")),
        }
    }

    /// CCCD payload enabling or disabling value updates
    ///
    /// Notify is preferred over indicate when both are declared.
    pub fn cccd_value(&self, enable: bool) -> [u8; 2] {
        if !enable {
            [0x00, 0x00]
        } else if self.properties.contains(CharacteristicProperties::NOTIFY) {
            [0x01, 0x00]
        } else {
            [0x02, 0x00]
        }
    }

    fn unsupported(&self, operation: &'static str) -> GattError {
        GattError::UnsupportedOperation {
            operation,
            characteristic: self.uuid,
        }
    }
}

/// GATT service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
    pub included_services: Vec<Uuid>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
            included_services: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    /// Attach a characteristic, re-parenting it onto this service
    pub fn with_characteristic(mut self, mut characteristic: Characteristic) -> Self {
        characteristic.service_uuid = self.uuid;
        self.characteristics.push(characteristic);
        self
    }

    pub fn with_included_service(mut self, uuid: Uuid) -> Self {
        self.included_services.push(uuid);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }

    pub fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| &c.uuid == uuid)
    }
}

// ----------------------------------------------------------------------------
// Devices
// ----------------------------------------------------------------------------

/// Advertisement contents from a single native sighting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub tx_power: Option<i16>,
}

impl AdvertisementData {
    /// Whether the advertisement names any of the given services
    ///
    /// An empty filter matches everything.
    pub fn matches_filter(&self, filter: &[Uuid]) -> bool {
        filter.is_empty()
            || filter.iter().any(|uuid| {
                self.service_uuids.contains(uuid) || self.service_data.contains_key(uuid)
            })
    }
}

/// Remote device known to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
    pub state: DeviceState,
    pub services: Vec<Service>,
    pub advertisement: AdvertisementData,
}

impl Device {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: None,
            rssi: 0,
            state: DeviceState::Disconnected,
            services: Vec::new(),
            advertisement: AdvertisementData::default(),
        }
    }

    /// Refresh name, signal strength and advertised data from a sighting
    ///
    /// A sighting without a name keeps the previously known one.
    pub fn refresh(&mut self, rssi: i16, advertisement: AdvertisementData) {
        self.rssi = rssi;
        if let Some(name) = &advertisement.local_name {
            self.name = Some(name.clone());
        }
        self.advertisement = advertisement;
    }

    pub fn service(&self, uuid: &Uuid) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| &s.uuid == uuid)
            .ok_or(GattError::ServiceNotFound {
                device: self.id,
                service: *uuid,
            })
    }

    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Result<&Characteristic> {
        self.service(service)?
            .characteristic(characteristic)
            .ok_or(GattError::CharacteristicNotFound {
                service: *service,
                characteristic: *characteristic,
            })
    }

    pub fn characteristic_mut(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<&mut Characteristic> {
        let device = self.id;
        self.services
            .iter_mut()
            .find(|s| &s.uuid == service)
            .ok_or(GattError::ServiceNotFound {
                device,
                service: *service,
            })?
            .characteristic_mut(characteristic)
            .ok_or(GattError::CharacteristicNotFound {
                service: *service,
                characteristic: *characteristic,
            })
    }

    /// Iterate over every characteristic of every discovered service
    pub fn characteristics_mut(&mut self) -> impl Iterator<Item = &mut Characteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
    }
}
