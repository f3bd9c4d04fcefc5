//! gattlink Core
//!
//! Runtime-independent building blocks for the gattlink BLE session layer: the
//! GATT entity model (devices, services, characteristics, property and
//! permission flags), device identity and UUID helpers, the fixed-layout
//! advertisement codec, configuration structures and the shared error type.
//!
//! Nothing in this crate is async; the session state machines live in
//! `gattlink-ble`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod config;
pub mod errors;
pub mod flags;
pub mod model;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{
    check_payload, AdvertisePacket, AdvertisementCodec, MAX_ADVERTISEMENT_PAYLOAD,
};
pub use config::{
    AdvertiseConfig, AdvertiseMode, ChannelConfig, DispatchPolicy, SessionConfig, TxPowerLevel,
};
pub use errors::{GattError, Result};
pub use flags::{CharacteristicPermissions, CharacteristicProperties, NativeStack};
pub use model::{
    AdvertisementData, Characteristic, Descriptor, Device, DeviceState, ManagerState, Service,
    WriteMode,
};
pub use types::{
    as_short_uuid, expand_uuid, short_uuid, short_uuid32, DeviceId, BLUETOOTH_BASE_UUID,
    CLIENT_CHARACTERISTIC_CONFIGURATION,
};
