//! Reactive session layer for Bluetooth Low Energy centrals.
//!
//! Platform BLE stacks report everything through one delegate: every
//! completion, for every device and attribute, arrives on the same callback
//! object without saying which call it answers. This crate sits between such a
//! transport and application code and turns it into independent,
//! composable, cancellable async operations keyed by device and attribute.
//!
//! # Features
//!
//! - **Radio gating**: every operation fails fast unless the radio is powered
//!   on, and in-flight work fails with [`Error::RadioUnavailable`] when it
//!   powers off
//! - **One session per device**: the [`DeviceRegistry`] hands out a single
//!   [`DeviceSession`] per identity, even under concurrent first access
//! - **Correlation**: callbacks are matched to the call waiting for them by
//!   device identity and attribute
//! - **Deduplication**: concurrent discoveries and reads of the same target
//!   share one hardware request; discovery results are cached until disconnect
//! - **Shared scanning**: any number of [`ScanStream`]s drive one hardware scan
//! - **Peripheral role**: [`CentralSession::advertise`] with guard-based teardown
//!
//! # Architecture
//!
//! ```text
//! adapter --TransportEvent--> EventSink ==> dispatch task --> EventBus
//!    ^                                      (applies state)      |
//!    |                                                           v
//!    +------------------ Transport commands <----------- DeviceSession / CentralSession
//! ```
//!
//! A platform adapter implements [`Transport`] for outbound commands and
//! pushes [`TransportEvent`]s into the [`EventSink`] obtained from
//! [`events::channel`]. The [`CentralSession`] owns the other end.
//! [`mock::MockTransport`] is a complete in-memory adapter for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bleplex_core::{CentralSession, ConnectOptions, ScanOptions, SessionConfig, Transport};
//! use bleplex_core::events::EventSource;
//! use bleplex_types::{RadioState, uuids};
//! use futures::StreamExt;
//!
//! async fn run(transport: Arc<dyn Transport>, events: EventSource) -> bleplex_core::Result<()> {
//!     let central = CentralSession::new(transport, events, SessionConfig::default())?;
//!     central.radio().wait_for(RadioState::PoweredOn).await?;
//!
//!     let mut scan = central.scan(&[uuids::BATTERY_SERVICE], ScanOptions::new());
//!     let Some(found) = scan.next().await.transpose()? else {
//!         return Ok(());
//!     };
//!     drop(scan);
//!
//!     let device = central.connect(&found.session, ConnectOptions::new()).await?;
//!     if let Some(level) = device
//!         .find_characteristic(uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
//!         .await?
//!     {
//!         println!("Battery: {}%", device.read_as::<u8>(&level).await?);
//!     }
//!     device.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod advertising;
pub mod central;
pub mod config;
mod context;
mod correlation;
mod dispatch;
pub mod error;
pub mod events;
pub mod mock;
pub mod options;
pub mod radio;
pub mod registry;
pub mod scan;
pub mod session;
pub mod transport;

// Core exports
pub use advertising::Advertisement;
pub use central::CentralSession;
pub use config::{ConfigError, ScanConfig, SessionConfig, ValidationError};
pub use error::{Error, NativeError, Result};
pub use events::{
    AncsAuthorization, ConnectionEvent, ConnectionEventKind, EventSink, EventSource,
    RestoredState, TransportEvent,
};
pub use options::{AdvertisingData, ConnectOptions, ConnectionEventOptions, ScanOptions};
pub use radio::RadioStateTracker;
pub use registry::DeviceRegistry;
pub use scan::{ScanResult, ScanStream};
pub use session::{DeviceSession, ValueStream};
pub use transport::Transport;

// Re-export from bleplex-types
pub use bleplex_types::uuid as uuids;
pub use bleplex_types::{
    AdvertisementData, AttributeKey, Characteristic, CharacteristicProperties, DeviceId,
    FromLeBytes, ParseError, RadioState, Service, WriteType,
};
