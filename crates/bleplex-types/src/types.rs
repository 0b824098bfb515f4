//! Core value types shared by the session layer and transport adapters.

use core::fmt;
use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable identity of a physical peripheral.
///
/// Assigned by the platform stack, never reused for different hardware and
/// stable across application restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Wrap a platform identifier.
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub const fn uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Power and availability state of the local Bluetooth radio.
///
/// Only [`RadioState::PoweredOn`] allows scanning, connecting or any
/// attribute traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RadioState {
    /// State not yet reported by the platform.
    #[default]
    Unknown,
    /// Connection with the system service was momentarily lost.
    Resetting,
    /// The platform has no Bluetooth Low Energy support.
    Unsupported,
    /// The application is not allowed to use Bluetooth.
    Unauthorized,
    /// Bluetooth is turned off.
    PoweredOff,
    /// Bluetooth is on and available.
    PoweredOn,
}

impl RadioState {
    /// Whether operations may be issued in this state.
    pub fn is_powered_on(self) -> bool {
        self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "powered off",
            RadioState::PoweredOn => "powered on",
        };
        f.write_str(label)
    }
}

/// GATT characteristic property bits, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// The characteristic can be broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// The value can be read.
    pub const READ: Self = Self(0x02);
    /// The value can be written without acknowledgement.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// The value can be written with acknowledgement.
    pub const WRITE: Self = Self(0x08);
    /// Value changes can be notified.
    pub const NOTIFY: Self = Self(0x10);
    /// Value changes can be indicated.
    pub const INDICATE: Self = Self(0x20);
    /// Signed writes are supported.
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Extended properties descriptor present.
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    /// No properties.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from the raw property byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw property byte.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the characteristic supports notifications or indications.
    pub const fn can_notify(self) -> bool {
        self.0 & (Self::NOTIFY.0 | Self::INDICATE.0) != 0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A discovered GATT service.
///
/// Identity is the native handle plus the owning device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Service {
    /// Device the service belongs to.
    pub device: DeviceId,
    /// Service UUID.
    pub uuid: Uuid,
    /// Native attribute handle.
    pub handle: u16,
    /// Whether this is a primary service.
    pub is_primary: bool,
}

impl Service {
    /// Create a primary service reference.
    pub fn new(device: DeviceId, uuid: Uuid, handle: u16) -> Self {
        Self {
            device,
            uuid,
            handle,
            is_primary: true,
        }
    }
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Characteristic {
    /// Device the characteristic belongs to.
    pub device: DeviceId,
    /// UUID of the owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Native attribute handle.
    pub handle: u16,
    /// Supported operations.
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    /// Create a characteristic reference.
    pub fn new(
        device: DeviceId,
        service: Uuid,
        uuid: Uuid,
        handle: u16,
        properties: CharacteristicProperties,
    ) -> Self {
        Self {
            device,
            service,
            uuid,
            handle,
            properties,
        }
    }

    /// The (service, characteristic) pair used to correlate attribute events.
    pub fn key(&self) -> AttributeKey {
        AttributeKey {
            service: self.service,
            characteristic: self.uuid,
        }
    }
}

/// Attribute address within one device: owning service plus characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttributeKey {
    /// Owning service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Common accessor for attributes that can be filtered by UUID.
pub trait Attribute {
    /// The attribute's UUID.
    fn uuid(&self) -> Uuid;
}

impl Attribute for Service {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl Attribute for Characteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Write mode for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WriteType {
    /// Wait for the peripheral to acknowledge the write.
    WithResponse,
    /// Fire and forget; the platform gives no acknowledgement.
    WithoutResponse,
}

/// Manufacturer-specific advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier.
    pub company_id: u16,
    /// Payload following the company identifier.
    pub data: Bytes,
}

/// Advertisement fields as already decoded by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvertisementData {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Manufacturer-specific data.
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Bytes>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
    /// Whether the peripheral accepts connections.
    pub is_connectable: bool,
}

impl AdvertisementData {
    /// Whether the advertisement lists any of `services`.
    ///
    /// An empty `services` slice matches every advertisement.
    pub fn advertises_any(&self, services: &[Uuid]) -> bool {
        services.is_empty() || services.iter().any(|s| self.service_uuids.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new(Uuid::from_u128(0x1234));
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000001234");
    }

    #[test]
    fn test_radio_state_default_is_unknown() {
        assert_eq!(RadioState::default(), RadioState::Unknown);
        assert!(!RadioState::default().is_powered_on());
        assert!(RadioState::PoweredOn.is_powered_on());
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.contains(CharacteristicProperties::READ));
        assert!(!props.contains(CharacteristicProperties::WRITE));
        assert!(props.can_notify());
        assert!(!CharacteristicProperties::READ.can_notify());
        assert_eq!(props.bits(), 0x12);
    }

    #[test]
    fn test_advertises_any() {
        let service = Uuid::from_u128(0x180F);
        let adv = AdvertisementData {
            service_uuids: vec![service],
            ..Default::default()
        };
        assert!(adv.advertises_any(&[]));
        assert!(adv.advertises_any(&[service]));
        assert!(!adv.advertises_any(&[Uuid::from_u128(0x180A)]));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_radio_state_serde() {
        let json = serde_json::to_string(&RadioState::PoweredOff).unwrap();
        assert_eq!(json, "\"powered_off\"");
        let parsed: RadioState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, RadioState::PoweredOff);
    }
}
