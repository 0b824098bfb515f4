//! Inbound transport events and the per-kind event bus.
//!
//! Adapters translate platform delegate callbacks into [`TransportEvent`]s and
//! push them through an [`EventSink`]. The central session drains the matching
//! [`EventSource`] on a single dispatch task, applies each event's effect on
//! session state and then re-publishes it on the [`EventBus`]: one broadcast
//! channel per callback kind. Operations subscribe to the kind they wait for and
//! filter by device identity and attribute.
//!
//! Every published message is wrapped in [`Sequenced`]. Sequence numbers are
//! assigned in dispatch order across all kinds, so an operation holding
//! receivers on two channels can tell which event was delivered first.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use bleplex_types::{AdvertisementData, AttributeKey, Characteristic, DeviceId, RadioState, Service};

use crate::error::NativeError;

/// A platform callback, translated by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The radio changed power state.
    RadioStateChanged(RadioState),
    /// A peripheral advertisement was received.
    DeviceDiscovered {
        /// Advertising peripheral.
        device: DeviceId,
        /// Decoded advertisement fields.
        advertisement: AdvertisementData,
        /// Received signal strength in dBm.
        rssi: i16,
    },
    /// A connection was established.
    Connected {
        /// Connected peripheral.
        device: DeviceId,
    },
    /// A connection ended.
    Disconnected {
        /// Disconnected peripheral.
        device: DeviceId,
        /// Cause, when the link was lost rather than cancelled.
        error: Option<NativeError>,
    },
    /// A connection attempt failed.
    FailedToConnect {
        /// Peripheral the attempt targeted.
        device: DeviceId,
        /// Cause reported by the platform.
        error: Option<NativeError>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Peripheral whose services were discovered.
        device: DeviceId,
        /// The adapter's full current service list for the peripheral.
        services: Vec<Service>,
        /// Discovery error.
        error: Option<NativeError>,
    },
    /// Characteristic discovery completed for one service.
    CharacteristicsDiscovered {
        /// Owning peripheral.
        device: DeviceId,
        /// Owning service UUID.
        service: Uuid,
        /// The adapter's full current characteristic list for the service.
        characteristics: Vec<Characteristic>,
        /// Discovery error.
        error: Option<NativeError>,
    },
    /// A characteristic value arrived, from a read or a notification.
    ValueUpdated {
        /// Owning peripheral.
        device: DeviceId,
        /// Characteristic address.
        characteristic: AttributeKey,
        /// New value, if any.
        value: Option<Bytes>,
        /// Read error.
        error: Option<NativeError>,
    },
    /// A write with response was acknowledged.
    WriteAcknowledged {
        /// Owning peripheral.
        device: DeviceId,
        /// Characteristic address.
        characteristic: AttributeKey,
        /// Write error.
        error: Option<NativeError>,
    },
    /// The notification state of a characteristic changed.
    NotificationStateChanged {
        /// Owning peripheral.
        device: DeviceId,
        /// Characteristic address.
        characteristic: AttributeKey,
        /// Whether notifications are now enabled.
        enabled: bool,
        /// Error, e.g. when the characteristic is not notifiable.
        error: Option<NativeError>,
    },
    /// The system restored state after relaunching the application.
    RestoreState(RestoredState),
    /// A registered connection event occurred.
    ConnectionEvent(ConnectionEvent),
    /// ANCS authorization changed for a peripheral.
    AncsAuthorizationChanged(AncsAuthorization),
    /// Peripheral-role advertising started, or failed to.
    AdvertisingStarted {
        /// Start error.
        error: Option<NativeError>,
    },
}

/// A bus message stamped with its dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequenced<E> {
    /// Position in dispatch order across every channel of the bus.
    pub seq: u64,
    /// The message.
    pub event: E,
}

/// A decoded advertisement from one peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    /// Advertising peripheral.
    pub device: DeviceId,
    /// Decoded advertisement fields.
    pub advertisement: AdvertisementData,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Connection lifecycle callbacks for a peripheral.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link is up.
    Connected(DeviceId),
    /// The link went down.
    Disconnected(DeviceId, Option<NativeError>),
    /// The connection attempt failed.
    FailedToConnect(DeviceId, Option<NativeError>),
}

impl LinkEvent {
    /// The peripheral the event concerns.
    pub fn device(&self) -> DeviceId {
        match self {
            LinkEvent::Connected(device)
            | LinkEvent::Disconnected(device, _)
            | LinkEvent::FailedToConnect(device, _) => *device,
        }
    }
}

/// Completion of a service discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicesEvent {
    /// Owning peripheral.
    pub device: DeviceId,
    /// Discovered services or the native error.
    pub result: Result<Vec<Service>, NativeError>,
}

/// Completion of a characteristic discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicsEvent {
    /// Owning peripheral.
    pub device: DeviceId,
    /// Owning service UUID.
    pub service: Uuid,
    /// Discovered characteristics or the native error.
    pub result: Result<Vec<Characteristic>, NativeError>,
}

/// An attribute callback: value update, write acknowledgement or
/// notification-state change.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEvent<T> {
    /// Owning peripheral.
    pub device: DeviceId,
    /// Characteristic address.
    pub key: AttributeKey,
    /// Payload or the native error.
    pub result: Result<T, NativeError>,
}

impl<T> AttributeEvent<T> {
    /// Whether the event concerns `key` on `device`.
    pub fn is_for(&self, device: DeviceId, key: AttributeKey) -> bool {
        self.device == device && self.key == key
    }
}

/// Characteristic value update.
pub type ValueEvent = AttributeEvent<Bytes>;
/// Write acknowledgement.
pub type WriteEvent = AttributeEvent<()>;
/// Notification state change; the payload is the new enabled flag.
pub type NotifyEvent = AttributeEvent<bool>;

/// State handed back by the system when relaunching the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredState {
    /// Peripherals that were connected or pending.
    pub devices: Vec<DeviceId>,
    /// Services the interrupted scan was filtering on.
    pub scan_services: Vec<Uuid>,
}

/// Kind of a system connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    /// A matching peer connected.
    PeerConnected,
    /// A matching peer disconnected.
    PeerDisconnected,
}

/// A system connection event for a registered peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// The peripheral.
    pub device: DeviceId,
    /// What happened.
    pub kind: ConnectionEventKind,
}

/// ANCS authorization update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncsAuthorization {
    /// The peripheral.
    pub device: DeviceId,
    /// Whether the peripheral may receive notification center data.
    pub authorized: bool,
}

/// Sending half handed to a transport adapter.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Deliver an event. Returns `false` once the central session is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Whether the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving half consumed by the central session.
#[derive(Debug)]
pub struct EventSource {
    pub(crate) receiver: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Create a connected sink/source pair.
///
/// The queue is unbounded so adapters never block inside a platform callback.
pub fn channel() -> (EventSink, EventSource) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSink { sender }, EventSource { receiver })
}

/// One broadcast channel per callback kind.
#[derive(Debug)]
pub(crate) struct EventBus {
    seq: AtomicU64,
    pub discovered: broadcast::Sender<Sequenced<Discovery>>,
    pub links: broadcast::Sender<Sequenced<LinkEvent>>,
    pub services: broadcast::Sender<Sequenced<ServicesEvent>>,
    pub characteristics: broadcast::Sender<Sequenced<CharacteristicsEvent>>,
    pub values: broadcast::Sender<Sequenced<ValueEvent>>,
    pub writes: broadcast::Sender<Sequenced<WriteEvent>>,
    pub notify: broadcast::Sender<Sequenced<NotifyEvent>>,
    pub restore: broadcast::Sender<Sequenced<RestoredState>>,
    pub connection_events: broadcast::Sender<Sequenced<ConnectionEvent>>,
    pub ancs: broadcast::Sender<Sequenced<AncsAuthorization>>,
    pub advertising: broadcast::Sender<Sequenced<Result<(), NativeError>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            discovered: broadcast::channel(capacity).0,
            links: broadcast::channel(capacity).0,
            services: broadcast::channel(capacity).0,
            characteristics: broadcast::channel(capacity).0,
            values: broadcast::channel(capacity).0,
            writes: broadcast::channel(capacity).0,
            notify: broadcast::channel(capacity).0,
            restore: broadcast::channel(capacity).0,
            connection_events: broadcast::channel(capacity).0,
            ancs: broadcast::channel(capacity).0,
            advertising: broadcast::channel(capacity).0,
        }
    }

    /// Stamp `event` and send it on `channel`. Returns the sequence number.
    ///
    /// Having no subscribers is not an error.
    pub fn publish<E>(&self, channel: &broadcast::Sender<Sequenced<E>>, event: E) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = channel.send(Sequenced { seq, event });
        seq
    }
}

/// Turn an optional native error plus payload into a result.
pub(crate) fn into_result<T>(value: T, error: Option<NativeError>) -> Result<T, NativeError> {
    match error {
        Some(err) => Err(err),
        None => Ok(value),
    }
}
