//! Option types passed through to the transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bleplex_types::DeviceId;

/// Options for a scan subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Report every advertisement instead of coalescing repeats per device.
    pub allow_duplicates: bool,
    /// Also discover peripherals soliciting these services.
    pub solicited_services: Vec<Uuid>,
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether duplicate advertisements are reported.
    #[must_use]
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    /// Set the solicited service UUIDs.
    #[must_use]
    pub fn solicited_services(mut self, services: Vec<Uuid>) -> Self {
        self.solicited_services = services;
        self
    }
}

/// Options for a connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Cancel the attempt if it has not completed within this duration.
    ///
    /// Falls back to `SessionConfig::connect_timeout_secs` when `None`.
    pub timeout: Option<Duration>,
    /// Ask the system to alert the user on connection while suspended.
    pub notify_on_connection: bool,
    /// Ask the system to alert the user on disconnection while suspended.
    pub notify_on_disconnection: bool,
    /// Ask the system to alert the user on notifications while suspended.
    pub notify_on_notification: bool,
}

impl ConnectOptions {
    /// Create new connect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the system alert flags.
    #[must_use]
    pub fn alerts(mut self, connection: bool, disconnection: bool, notification: bool) -> Self {
        self.notify_on_connection = connection;
        self.notify_on_disconnection = disconnection;
        self.notify_on_notification = notification;
        self
    }
}

/// Filter for connection events raised by the system for other apps' links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionEventOptions {
    /// Match peripherals exposing any of these services.
    pub services: Vec<Uuid>,
    /// Match these peripherals.
    pub peripherals: Vec<DeviceId>,
}

/// Payload for peripheral-role advertising.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingData {
    /// Local name to advertise.
    pub local_name: Option<String>,
    /// Service UUIDs to advertise.
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisingData {
    /// Advertise under the given local name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            local_name: Some(name.into()),
            service_uuids: Vec::new(),
        }
    }

    /// Add an advertised service.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }
}
