//! Property-based tests for the advertisement codec, device identity and flag
//! translation

use gattlink_core::{
    flags::{CharacteristicPermissions, CharacteristicProperties, NativeStack},
    types::format_mac,
    AdvertisementCodec, DeviceId, GattError, MAX_ADVERTISEMENT_PAYLOAD,
};
use proptest::prelude::*;

/// Generate a field layout of one to eight widths
fn arb_layout() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=8, 1..=8)
}

/// Generate a layout together with matching field contents
fn arb_fields() -> impl Strategy<Value = (Vec<usize>, Vec<Vec<u8>>)> {
    arb_layout().prop_flat_map(|layout| {
        let fields: Vec<_> = layout
            .iter()
            .map(|w| prop::collection::vec(any::<u8>(), *w))
            .collect();
        (Just(layout), fields)
    })
}

fn arb_stack() -> impl Strategy<Value = NativeStack> {
    prop_oneof![
        Just(NativeStack::Android),
        Just(NativeStack::CoreBluetooth),
        Just(NativeStack::Btleplug),
    ]
}

proptest! {
    /// Property: encoding never yields more than the payload ceiling, and
    /// anything over it is rejected rather than truncated
    #[test]
    fn encode_respects_ceiling((layout, fields) in arb_fields()) {
        let codec = AdvertisementCodec::new(&layout);
        let total: usize = layout.iter().sum();

        match codec.encode(&fields) {
            Ok(bytes) => {
                prop_assert!(bytes.len() <= MAX_ADVERTISEMENT_PAYLOAD);
                prop_assert_eq!(bytes.len(), total);
                prop_assert_eq!(codec.decode(&bytes).unwrap(), fields);
            }
            Err(GattError::PayloadTooLarge { size, max }) => {
                prop_assert!(total > MAX_ADVERTISEMENT_PAYLOAD);
                prop_assert_eq!(size, total);
                prop_assert_eq!(max, MAX_ADVERTISEMENT_PAYLOAD);
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    /// Property: distinct MAC addresses never share a device id
    #[test]
    fn device_id_is_injective(a in any::<[u8; 6]>(), b in any::<[u8; 6]>()) {
        let id_a = DeviceId::from_mac(a);
        let id_b = DeviceId::from_mac(b);
        prop_assert_eq!(a == b, id_a == id_b);
    }

    /// Property: the textual address path agrees with the raw byte path
    #[test]
    fn device_id_is_deterministic(mac in any::<[u8; 6]>()) {
        let address = format_mac(&mac);
        let parsed = DeviceId::from_address(&address).unwrap();
        prop_assert_eq!(parsed, DeviceId::from_mac(mac));
        prop_assert_eq!(parsed.mac(), Some(mac));
    }

    /// Property: translating to native and back keeps exactly the supported bits
    #[test]
    fn flag_translation_keeps_supported_bits(
        stack in arb_stack(),
        props in any::<u16>(),
        perms in any::<u16>(),
    ) {
        let props = CharacteristicProperties::from_bits_truncate(props);
        let perms = CharacteristicPermissions::from_bits_truncate(perms);

        let props_back = stack.properties_from_native(stack.properties_to_native(props));
        prop_assert_eq!(props_back, props & stack.supported_properties());

        let perms_back = stack.permissions_from_native(stack.permissions_to_native(perms));
        prop_assert_eq!(perms_back, perms & stack.supported_permissions());
    }
}
