//! Platform-agnostic types for the bleplex BLE session layer.
//!
//! This crate provides the value types shared by `bleplex-core` and by
//! transport adapters that feed it: device identity, radio state, attribute
//! handles, decoded advertisement fields, and the byte codec used to turn raw
//! attribute values into numbers.
//!
//! # Example
//!
//! ```
//! use bleplex_types::{codec, RadioState};
//!
//! assert!(RadioState::PoweredOn.is_powered_on());
//! assert_eq!(codec::to_u16(&[0x2C, 0x01]), Ok(300));
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use codec::{FromLeBytes, ValueReader};
pub use error::{ParseError, ParseResult};
pub use types::{
    AdvertisementData, Attribute, AttributeKey, Characteristic, CharacteristicProperties,
    DeviceId, ManufacturerData, RadioState, Service, WriteType,
};
pub use uuid as uuids;
