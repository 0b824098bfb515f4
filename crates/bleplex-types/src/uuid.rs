//! Bluetooth SIG UUID helpers.
//!
//! Short 16-bit and 32-bit assigned numbers expand into the Bluetooth base
//! UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID.
pub const BLUETOOTH_BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit assigned number into a full UUID.
pub const fn from_u16(short: u16) -> Uuid {
    from_u32(short as u32)
}

/// Expand a 32-bit assigned number into a full UUID.
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// The 16-bit assigned number, if `uuid` is derived from the base UUID.
pub fn to_u16(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = (1u128 << 96) - 1;
    if value & mask == BLUETOOTH_BASE_UUID.as_u128() && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

// --- Standard BLE Service UUIDs ---

/// Generic Access Profile (GAP) service.
pub const GAP_SERVICE: Uuid = from_u16(0x1800);

/// Generic Attribute Profile (GATT) service.
pub const GATT_SERVICE: Uuid = from_u16(0x1801);

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = from_u16(0x180A);

/// Battery service.
pub const BATTERY_SERVICE: Uuid = from_u16(0x180F);

// --- Standard Characteristic UUIDs ---

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = from_u16(0x2A00);

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = from_u16(0x2A19);

/// Model number string characteristic.
pub const MODEL_NUMBER: Uuid = from_u16(0x2A24);

/// Serial number string characteristic.
pub const SERIAL_NUMBER: Uuid = from_u16(0x2A25);

/// Firmware revision string characteristic.
pub const FIRMWARE_REVISION: Uuid = from_u16(0x2A26);

/// Manufacturer name string characteristic.
pub const MANUFACTURER_NAME: Uuid = from_u16(0x2A29);

/// Client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2902);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_service_uuid() {
        let expected = "0000180f-0000-1000-8000-00805f9b34fb";
        assert_eq!(BATTERY_SERVICE.to_string(), expected);
    }

    #[test]
    fn test_battery_level_uuid() {
        let expected = "00002a19-0000-1000-8000-00805f9b34fb";
        assert_eq!(BATTERY_LEVEL.to_string(), expected);
    }

    #[test]
    fn test_from_u32() {
        let expected = "12345678-0000-1000-8000-00805f9b34fb";
        assert_eq!(from_u32(0x1234_5678).to_string(), expected);
    }

    #[test]
    fn test_to_u16_roundtrip_for_assigned_numbers() {
        assert_eq!(to_u16(DEVICE_INFO_SERVICE), Some(0x180A));
        assert_eq!(to_u16(from_u32(0x1234_5678)), None);
        assert_eq!(
            to_u16(uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c")),
            None
        );
    }
}
