//! Identity types for the GATT session layer
//!
//! Device identities are UUIDs derived from the native address so that the same
//! radio maps to the same id across scan passes, and attribute UUIDs follow
//! the Bluetooth SIG base UUID convention for 16- and 32-bit short forms.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{GattError, Result};

// ----------------------------------------------------------------------------
// Bluetooth Base UUID
// ----------------------------------------------------------------------------

/// Suffix shared by every SIG short-form UUID
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Bluetooth SIG base UUID `00000000-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// Client Characteristic Configuration Descriptor (`0x2902`)
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Expand a 16-bit SIG short UUID onto the base UUID
pub const fn short_uuid(short: u16) -> Uuid {
    short_uuid32(short as u32)
}

/// Expand a 32-bit SIG short UUID onto the base UUID
pub const fn short_uuid32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Expand a UUID string into a full UUID
///
/// Four-character input is zero padded to eight characters, eight-character
/// input is used as the first group of `{prefix}-0000-1000-8000-00805f9b34fb`.
/// Anything else must already be a full UUID.
pub fn expand_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let full = match trimmed.len() {
        4 => format!("0000{}{}", trimmed, BASE_UUID_SUFFIX),
        8 => format!("{}{}", trimmed, BASE_UUID_SUFFIX),
        _ => trimmed.to_string(),
    };

    Uuid::parse_str(&full).map_err(|_| GattError::InvalidUuid {
        input: input.to_string(),
    })
}

/// Return the 16-bit short form if the UUID sits on the SIG base
pub fn as_short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = (1u128 << 96) - 1;
    if value & mask != BLUETOOTH_BASE_UUID.as_u128() {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Stable identity for a remote device
///
/// Address-based ids place the six MAC bytes in `bytes[10..16]` and leave the
/// rest zero, so distinct addresses always produce distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Wrap an opaque native identifier (CoreBluetooth hands out UUIDs directly)
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derive the id from raw MAC bytes
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[10..16].copy_from_slice(&mac);
        Self(Uuid::from_bytes(bytes))
    }

    /// Derive the id from a colon-delimited MAC address such as `AA:BB:CC:DD:EE:FF`
    pub fn from_address(address: &str) -> Result<Self> {
        parse_mac(address).map(Self::from_mac)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Recover the MAC bytes if this id was derived from an address
    pub fn mac(&self) -> Option<[u8; 6]> {
        let bytes = self.0.as_bytes();
        if bytes[..10].iter().any(|b| *b != 0) {
            return None;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[10..16]);
        Some(mac)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DeviceId {
    type Err = GattError;

    /// Accepts either a full UUID or a MAC address
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self(uuid));
        }
        Self::from_address(s)
    }
}

impl From<[u8; 6]> for DeviceId {
    fn from(mac: [u8; 6]) -> Self {
        Self::from_mac(mac)
    }
}

/// Decode a MAC address, tolerating `:` or `-` separators
pub fn parse_mac(address: &str) -> Result<[u8; 6]> {
    let invalid = || GattError::InvalidAddress {
        input: address.to_string(),
    };

    let digits: String = address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    let bytes = hex::decode(digits).map_err(|_| invalid())?;

    <[u8; 6]>::try_from(bytes.as_slice()).map_err(|_| invalid())
}

/// Format MAC bytes as `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_layout() {
        let id = DeviceId::from_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-aabbccddeeff");
        assert_eq!(id.mac(), Some([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn test_device_id_rejects_bad_addresses() {
        assert!(DeviceId::from_address("AA:BB:CC").is_err());
        assert!(DeviceId::from_address("ZZ:BB:CC:DD:EE:FF").is_err());
        assert!(DeviceId::from_address("AA:BB:CC:DD:EE:FF:00").is_err());
    }

    #[test]
    fn test_device_id_from_str_accepts_both_forms() {
        let from_mac: DeviceId = "01:02:03:04:05:06".parse().unwrap();
        let from_uuid: DeviceId = "00000000-0000-0000-0000-010203040506".parse().unwrap();
        assert_eq!(from_mac, from_uuid);
    }

    #[test]
    fn test_native_uuid_has_no_mac() {
        let id = DeviceId::from_uuid(Uuid::from_u128(0x1234_5678_0000_0000_0000_0000_0000_0001));
        assert_eq!(id.mac(), None);
    }

    #[test]
    fn test_expand_short_uuids() {
        assert_eq!(
            expand_uuid("BEEF").unwrap().to_string(),
            "0000beef-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            expand_uuid("1234abcd").unwrap().to_string(),
            "1234abcd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            expand_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap(),
            Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E)
        );
        assert!(expand_uuid("xyz").is_err());
    }

    #[test]
    fn test_short_uuid_round_trip() {
        assert_eq!(short_uuid(0x2902), CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(as_short_uuid(&short_uuid(0x180F)), Some(0x180F));
        assert_eq!(as_short_uuid(&Uuid::from_u128(7)), None);
        assert_eq!(expand_uuid("2902").unwrap(), short_uuid(0x2902));
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0xAA, 0x01, 0x02, 0x03, 0x04, 0xFF]), "AA:01:02:03:04:FF");
    }
}
