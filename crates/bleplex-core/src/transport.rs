//! The capability interface the session layer issues commands through.
//!
//! A transport wraps one platform central manager and its peripherals. Every
//! command is fire-and-forget: completion is reported later as a
//! [`TransportEvent`](crate::events::TransportEvent) pushed into the
//! [`EventSink`](crate::events::EventSink) the adapter was given. The session
//! layer never inspects which implementation it talks to; real adapters and
//! [`MockTransport`](crate::mock::MockTransport) are interchangeable.
//!
//! Implementations must not block and must not call back into the session
//! layer synchronously; commands may be issued while session state is locked.

use uuid::Uuid;

use bleplex_types::{Characteristic, DeviceId, Service, WriteType};

use crate::options::{AdvertisingData, ConnectOptions, ConnectionEventOptions, ScanOptions};

/// Outbound commands understood by a platform adapter.
pub trait Transport: Send + Sync {
    /// Start (or restart with a new filter) the hardware scan.
    ///
    /// An empty `services` slice scans for every peripheral.
    fn start_scan(&self, services: &[Uuid], options: &ScanOptions);

    /// Stop the hardware scan.
    fn stop_scan(&self);

    /// Whether the hardware is currently scanning.
    fn is_scanning(&self) -> bool;

    /// Begin connecting to a peripheral.
    fn connect(&self, device: DeviceId, options: &ConnectOptions);

    /// Cancel a pending connection or tear down an established one.
    fn cancel_connection(&self, device: DeviceId);

    /// Discover services, optionally restricted to `services`.
    ///
    /// Completion is reported as `ServicesDiscovered` carrying the adapter's
    /// full current service list.
    fn discover_services(&self, device: DeviceId, services: Option<&[Uuid]>);

    /// Discover characteristics of `service`, optionally restricted.
    fn discover_characteristics(&self, service: &Service, characteristics: Option<&[Uuid]>);

    /// Read a characteristic value.
    fn read_value(&self, characteristic: &Characteristic);

    /// Write a characteristic value.
    fn write_value(&self, characteristic: &Characteristic, value: &[u8], write_type: WriteType);

    /// Enable or disable notifications or indications.
    fn set_notify(&self, characteristic: &Characteristic, enabled: bool);

    /// Peripherals known to the system among `ids`.
    fn retrieve_peripherals(&self, ids: &[DeviceId]) -> Vec<DeviceId>;

    /// Peripherals connected to the system exposing any of `services`.
    fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<DeviceId>;

    /// Ask the system to report connection events matching `options`.
    fn register_for_connection_events(&self, options: &ConnectionEventOptions);

    /// Start peripheral-role advertising.
    fn start_advertising(&self, data: &AdvertisingData);

    /// Stop peripheral-role advertising.
    fn stop_advertising(&self);
}
