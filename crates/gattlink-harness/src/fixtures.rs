//! Sample devices and GATT tables used across session tests

use gattlink_core::{
    short_uuid, AdvertisementData, Characteristic, CharacteristicPermissions,
    CharacteristicProperties, Descriptor, DeviceId, Service, CLIENT_CHARACTERISTIC_CONFIGURATION,
};
use gattlink_ble::CharacteristicRef;
use uuid::Uuid;

pub const TEST_SERVICE: u16 = 0xBEEF;
/// Read only
pub const READ_ONLY: u16 = 0xBEF0;
/// Write with response only
pub const WRITABLE: u16 = 0xBEF1;
/// Write without response only
pub const WRITE_NO_RESPONSE: u16 = 0xBEF2;
/// Read + notify
pub const NOTIFYING: u16 = 0xBEF3;
/// Indicate only
pub const INDICATING: u16 = 0xBEF4;

pub fn test_service_uuid() -> Uuid {
    short_uuid(TEST_SERVICE)
}

/// Device id derived from a MAC ending in `n`
pub fn device(n: u8) -> DeviceId {
    DeviceId::from_mac([0xC0, 0xFF, 0xEE, 0x00, 0x00, n])
}

/// Reference to a characteristic of the test service
pub fn target(device: DeviceId, characteristic: u16) -> CharacteristicRef {
    CharacteristicRef::new(device, test_service_uuid(), short_uuid(characteristic))
}

/// Advertisement naming the device and listing the test service
pub fn advertisement(name: &str) -> AdvertisementData {
    AdvertisementData {
        local_name: Some(name.to_string()),
        service_uuids: vec![test_service_uuid()],
        ..Default::default()
    }
}

/// GATT table covering every access pattern the sessions distinguish
pub fn test_service() -> Service {
    let service = test_service_uuid();
    let cccd = || Descriptor::new(CLIENT_CHARACTERISTIC_CONFIGURATION);

    Service::new(service)
        .with_characteristic(
            Characteristic::new(short_uuid(READ_ONLY), service, CharacteristicProperties::READ)
                .with_permissions(CharacteristicPermissions::READ)
                .with_value(b"ro".to_vec()),
        )
        .with_characteristic(
            Characteristic::new(short_uuid(WRITABLE), service, CharacteristicProperties::WRITE)
                .with_permissions(CharacteristicPermissions::WRITE),
        )
        .with_characteristic(
            Characteristic::new(
                short_uuid(WRITE_NO_RESPONSE),
                service,
                CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            )
            .with_permissions(CharacteristicPermissions::WRITE),
        )
        .with_characteristic(
            Characteristic::new(
                short_uuid(NOTIFYING),
                service,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .with_permissions(CharacteristicPermissions::READ)
            .with_descriptor(cccd()),
        )
        .with_characteristic(
            Characteristic::new(
                short_uuid(INDICATING),
                service,
                CharacteristicProperties::INDICATE,
            )
            .with_descriptor(cccd()),
        )
}
