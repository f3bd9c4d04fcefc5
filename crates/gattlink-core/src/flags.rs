//! Characteristic property and permission flags
//!
//! The abstract bitsets are what the session layer reasons about. Each native
//! stack has its own numbering, so translation goes through explicit per-stack
//! tables. Bits a stack cannot express are dropped silently when translating
//! in either direction; every bit a stack does support round-trips unchanged.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Abstract Flag Sets
// ----------------------------------------------------------------------------

bitflags::bitflags! {
    /// Operations a characteristic allows
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CharacteristicProperties: u16 {
        const BROADCAST = 1 << 0;
        const READ = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const WRITE = 1 << 3;
        const NOTIFY = 1 << 4;
        const INDICATE = 1 << 5;
        const AUTHENTICATED_SIGNED_WRITES = 1 << 6;
        const EXTENDED_PROPERTIES = 1 << 7;
        const NOTIFY_ENCRYPTION_REQUIRED = 1 << 8;
        const INDICATE_ENCRYPTION_REQUIRED = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Access control on a characteristic value
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CharacteristicPermissions: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_ENCRYPTED = 1 << 2;
        const WRITE_ENCRYPTED = 1 << 3;
        const READ_ENCRYPTED_MITM = 1 << 4;
        const WRITE_ENCRYPTED_MITM = 1 << 5;
        const WRITE_SIGNED = 1 << 6;
        const WRITE_SIGNED_MITM = 1 << 7;
    }
}

impl CharacteristicProperties {
    /// Whether any write flavour is allowed
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// Whether the value can be pushed by the remote (notify or indicate)
    pub fn can_update(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

// ----------------------------------------------------------------------------
// Native Translation Tables
// ----------------------------------------------------------------------------

/// Native BLE stacks with a known flag numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeStack {
    /// `BluetoothGattCharacteristic.PROPERTY_*` / `PERMISSION_*`
    Android,
    /// `CBCharacteristicProperties` / `CBAttributePermissions`
    CoreBluetooth,
    /// btleplug `CharPropFlags` (central only, no permissions)
    Btleplug,
}

type PropertyTable = &'static [(CharacteristicProperties, u32)];
type PermissionTable = &'static [(CharacteristicPermissions, u32)];

// Android has no encryption-required notify/indicate properties.
const ANDROID_PROPERTIES: PropertyTable = &[
    (CharacteristicProperties::BROADCAST, 0x01),
    (CharacteristicProperties::READ, 0x02),
    (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, 0x04),
    (CharacteristicProperties::WRITE, 0x08),
    (CharacteristicProperties::NOTIFY, 0x10),
    (CharacteristicProperties::INDICATE, 0x20),
    (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, 0x40),
    (CharacteristicProperties::EXTENDED_PROPERTIES, 0x80),
];

const ANDROID_PERMISSIONS: PermissionTable = &[
    (CharacteristicPermissions::READ, 0x01),
    (CharacteristicPermissions::READ_ENCRYPTED, 0x02),
    (CharacteristicPermissions::READ_ENCRYPTED_MITM, 0x04),
    (CharacteristicPermissions::WRITE, 0x10),
    (CharacteristicPermissions::WRITE_ENCRYPTED, 0x20),
    (CharacteristicPermissions::WRITE_ENCRYPTED_MITM, 0x40),
    (CharacteristicPermissions::WRITE_SIGNED, 0x80),
    (CharacteristicPermissions::WRITE_SIGNED_MITM, 0x100),
];

const CORE_BLUETOOTH_PROPERTIES: PropertyTable = &[
    (CharacteristicProperties::BROADCAST, 0x01),
    (CharacteristicProperties::READ, 0x02),
    (CharacteristicProperties::WRITE_WITHOUT_RESPONSE, 0x04),
    (CharacteristicProperties::WRITE, 0x08),
    (CharacteristicProperties::NOTIFY, 0x10),
    (CharacteristicProperties::INDICATE, 0x20),
    (CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES, 0x40),
    (CharacteristicProperties::EXTENDED_PROPERTIES, 0x80),
    (CharacteristicProperties::NOTIFY_ENCRYPTION_REQUIRED, 0x100),
    (CharacteristicProperties::INDICATE_ENCRYPTION_REQUIRED, 0x200),
];

// CoreBluetooth has no MITM or signed-write permission levels.
const CORE_BLUETOOTH_PERMISSIONS: PermissionTable = &[
    (CharacteristicPermissions::READ, 0x01),
    (CharacteristicPermissions::WRITE, 0x02),
    (CharacteristicPermissions::READ_ENCRYPTED, 0x04),
    (CharacteristicPermissions::WRITE_ENCRYPTED, 0x08),
];

impl NativeStack {
    fn property_table(self) -> PropertyTable {
        match self {
            NativeStack::Android | NativeStack::Btleplug => ANDROID_PROPERTIES,
            NativeStack::CoreBluetooth => CORE_BLUETOOTH_PROPERTIES,
        }
    }

    fn permission_table(self) -> PermissionTable {
        match self {
            NativeStack::Android => ANDROID_PERMISSIONS,
            NativeStack::CoreBluetooth => CORE_BLUETOOTH_PERMISSIONS,
            NativeStack::Btleplug => &[],
        }
    }

    /// Abstract properties this stack can represent
    pub fn supported_properties(self) -> CharacteristicProperties {
        self.property_table()
            .iter()
            .fold(CharacteristicProperties::empty(), |acc, (flag, _)| acc | *flag)
    }

    /// Abstract permissions this stack can represent
    pub fn supported_permissions(self) -> CharacteristicPermissions {
        self.permission_table()
            .iter()
            .fold(CharacteristicPermissions::empty(), |acc, (flag, _)| acc | *flag)
    }

    pub fn properties_to_native(self, properties: CharacteristicProperties) -> u32 {
        self.property_table()
            .iter()
            .filter(|(flag, _)| properties.contains(*flag))
            .fold(0, |acc, (_, native)| acc | native)
    }

    pub fn properties_from_native(self, native: u32) -> CharacteristicProperties {
        self.property_table()
            .iter()
            .filter(|(_, bit)| native & bit != 0)
            .fold(CharacteristicProperties::empty(), |acc, (flag, _)| acc | *flag)
    }

    pub fn permissions_to_native(self, permissions: CharacteristicPermissions) -> u32 {
        self.permission_table()
            .iter()
            .filter(|(flag, _)| permissions.contains(*flag))
            .fold(0, |acc, (_, native)| acc | native)
    }

    pub fn permissions_from_native(self, native: u32) -> CharacteristicPermissions {
        self.permission_table()
            .iter()
            .filter(|(_, bit)| native & bit != 0)
            .fold(CharacteristicPermissions::empty(), |acc, (flag, _)| acc | *flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACKS: [NativeStack; 3] = [
        NativeStack::Android,
        NativeStack::CoreBluetooth,
        NativeStack::Btleplug,
    ];

    #[test]
    fn test_supported_properties_round_trip_every_bit() {
        for stack in STACKS {
            for flag in stack.supported_properties().iter() {
                let native = stack.properties_to_native(flag);
                assert_ne!(native, 0, "{:?} lost {:?}", stack, flag);
                assert_eq!(stack.properties_from_native(native), flag);
            }
        }
    }

    #[test]
    fn test_supported_permissions_round_trip_every_bit() {
        for stack in STACKS {
            for flag in stack.supported_permissions().iter() {
                let native = stack.permissions_to_native(flag);
                assert_eq!(stack.permissions_from_native(native), flag);
            }
        }
    }

    #[test]
    fn test_full_sets_round_trip() {
        for stack in STACKS {
            let props = stack.supported_properties();
            assert_eq!(
                stack.properties_from_native(stack.properties_to_native(props)),
                props
            );
            let perms = stack.supported_permissions();
            assert_eq!(
                stack.permissions_from_native(stack.permissions_to_native(perms)),
                perms
            );
        }
    }

    #[test]
    fn test_unsupported_bits_are_dropped() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY_ENCRYPTION_REQUIRED;
        assert_eq!(NativeStack::Android.properties_to_native(props), 0x02);

        let perms = CharacteristicPermissions::WRITE | CharacteristicPermissions::WRITE_SIGNED_MITM;
        assert_eq!(NativeStack::CoreBluetooth.permissions_to_native(perms), 0x02);

        // Unknown native bits are ignored too
        assert_eq!(
            NativeStack::Android.properties_from_native(0x02 | 0x8000),
            CharacteristicProperties::READ
        );
    }

    #[test]
    fn test_android_write_permission_is_not_read_bit() {
        assert_eq!(
            NativeStack::Android.permissions_from_native(0x10),
            CharacteristicPermissions::WRITE
        );
        assert_eq!(
            NativeStack::Android.permissions_from_native(0x01),
            CharacteristicPermissions::READ
        );
    }

    #[test]
    fn test_capability_helpers() {
        assert!(CharacteristicProperties::WRITE_WITHOUT_RESPONSE.can_write());
        assert!(CharacteristicProperties::INDICATE.can_update());
        assert!(!CharacteristicProperties::READ.can_write());
        assert!(!CharacteristicProperties::READ.can_update());
    }
}
