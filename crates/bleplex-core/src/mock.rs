//! In-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] against a set of simulated
//! peripherals and answers every command through the same [`EventSink`] a real
//! adapter would use, so the whole session layer runs unchanged on top of it.
//!
//! # Features
//!
//! - **Command log**: every command is recorded as a [`MockCommand`]
//! - **Failure injection**: connect, discovery, read, write, notify and
//!   advertising failures with a chosen [`NativeError`]
//! - **Holding**: [`MockTransport::hold`] queues responses until
//!   [`MockTransport::release`], to test callers attaching to in-flight work
//! - **Platform events**: radio changes, advertisements, notifications and
//!   link loss can be injected at any time
//!
//! # Example
//!
//! ```
//! use bleplex_core::mock::{MockCharacteristic, MockPeripheral, MockService, MockTransport};
//! use bleplex_core::{CentralSession, ConnectOptions, SessionConfig};
//! use bleplex_types::{DeviceId, uuids};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (transport, events) = MockTransport::new();
//!     let id = DeviceId::new(Uuid::from_u128(1));
//!     transport.add_peripheral(
//!         MockPeripheral::new(id).name("Sensor").service(
//!             MockService::new(uuids::BATTERY_SERVICE)
//!                 .characteristic(MockCharacteristic::readable(uuids::BATTERY_LEVEL, vec![87])),
//!         ),
//!     );
//!
//!     let central = CentralSession::new(transport.clone(), events, SessionConfig::default()).unwrap();
//!     transport.power_on();
//!     central.radio().wait_for(bleplex_types::RadioState::PoweredOn).await.unwrap();
//!
//!     let device = central.connect(&central.device(id), ConnectOptions::new()).await.unwrap();
//!     let level = device
//!         .find_characteristic(uuids::BATTERY_SERVICE, uuids::BATTERY_LEVEL)
//!         .await
//!         .unwrap()
//!         .unwrap();
//!     assert_eq!(device.read_as::<u8>(&level).await.unwrap(), 87);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::trace;
use uuid::Uuid;

use bleplex_types::{
    AdvertisementData, AttributeKey, Characteristic, CharacteristicProperties, DeviceId,
    RadioState, Service, WriteType,
};

use crate::error::NativeError;
use crate::events::{self, EventSink, EventSource, TransportEvent};
use crate::options::{AdvertisingData, ConnectOptions, ConnectionEventOptions, ScanOptions};
use crate::transport::Transport;

/// Error domain used for failures produced by the mock itself.
pub const MOCK_ERROR_DOMAIN: &str = "MockTransport";

/// A simulated characteristic.
#[derive(Debug, Clone)]
pub struct MockCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Bytes,
    read_error: Option<NativeError>,
    write_error: Option<NativeError>,
}

impl MockCharacteristic {
    /// A characteristic with the given properties and an empty value.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: Bytes::new(),
            read_error: None,
            write_error: None,
        }
    }

    /// A readable characteristic holding `value`.
    pub fn readable(uuid: Uuid, value: impl Into<Bytes>) -> Self {
        Self::new(uuid, CharacteristicProperties::READ).value(value)
    }

    /// A readable, notifying characteristic holding `value`.
    pub fn notifying(uuid: Uuid, value: impl Into<Bytes>) -> Self {
        Self::new(
            uuid,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        )
        .value(value)
    }

    /// A characteristic accepting both write types.
    pub fn writable(uuid: Uuid) -> Self {
        Self::new(
            uuid,
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        )
    }

    /// Set the current value.
    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Fail every read with `error`.
    pub fn read_error(mut self, error: NativeError) -> Self {
        self.read_error = Some(error);
        self
    }

    /// Fail every acknowledged write with `error`.
    pub fn write_error(mut self, error: NativeError) -> Self {
        self.write_error = Some(error);
        self
    }
}

/// A simulated service.
#[derive(Debug, Clone)]
pub struct MockService {
    uuid: Uuid,
    characteristics: Vec<MockCharacteristic>,
    discovery_error: Option<NativeError>,
}

impl MockService {
    /// An empty service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
            discovery_error: None,
        }
    }

    /// Add a characteristic.
    pub fn characteristic(mut self, characteristic: MockCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Fail characteristic discovery with `error`.
    pub fn discovery_error(mut self, error: NativeError) -> Self {
        self.discovery_error = Some(error);
        self
    }
}

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    id: DeviceId,
    name: Option<String>,
    services: Vec<MockService>,
    connect_error: Option<NativeError>,
    discovery_error: Option<NativeError>,
}

impl MockPeripheral {
    /// A peripheral with no services.
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: None,
            services: Vec::new(),
            connect_error: None,
            discovery_error: None,
        }
    }

    /// Set the advertised local name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a service.
    pub fn service(mut self, service: MockService) -> Self {
        self.services.push(service);
        self
    }

    /// Fail every connection attempt with `error`.
    pub fn connect_error(mut self, error: NativeError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Fail service discovery with `error`.
    pub fn discovery_error(mut self, error: NativeError) -> Self {
        self.discovery_error = Some(error);
        self
    }

    /// The advertisement this peripheral broadcasts.
    pub fn advertisement(&self) -> AdvertisementData {
        AdvertisementData {
            local_name: self.name.clone(),
            service_uuids: self.services.iter().map(|s| s.uuid).collect(),
            is_connectable: true,
            ..AdvertisementData::default()
        }
    }

    fn find_service(&self, uuid: Uuid) -> Option<(usize, &MockService)> {
        self.services.iter().enumerate().find(|(_, s)| s.uuid == uuid)
    }

    fn find_characteristic_mut(&mut self, key: AttributeKey) -> Option<&mut MockCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == key.service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == key.characteristic)
    }

    fn service_handle(index: usize) -> u16 {
        ((index + 1) * 0x100) as u16
    }
}

/// A command received by the mock, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    /// `start_scan`.
    StartScan {
        /// Hardware service filter.
        services: Vec<Uuid>,
        /// Scan options.
        options: ScanOptions,
    },
    /// `stop_scan`.
    StopScan,
    /// `connect`.
    Connect(DeviceId),
    /// `cancel_connection`.
    CancelConnection(DeviceId),
    /// `discover_services`.
    DiscoverServices {
        /// Target peripheral.
        device: DeviceId,
        /// Service filter.
        filter: Option<Vec<Uuid>>,
    },
    /// `discover_characteristics`.
    DiscoverCharacteristics {
        /// Target peripheral.
        device: DeviceId,
        /// Owning service.
        service: Uuid,
        /// Characteristic filter.
        filter: Option<Vec<Uuid>>,
    },
    /// `read_value`.
    Read {
        /// Target peripheral.
        device: DeviceId,
        /// Characteristic address.
        key: AttributeKey,
    },
    /// `write_value`.
    Write {
        /// Target peripheral.
        device: DeviceId,
        /// Characteristic address.
        key: AttributeKey,
        /// Written bytes.
        value: Bytes,
        /// Write mode.
        write_type: WriteType,
    },
    /// `set_notify`.
    SetNotify {
        /// Target peripheral.
        device: DeviceId,
        /// Characteristic address.
        key: AttributeKey,
        /// Requested state.
        enabled: bool,
    },
    /// `retrieve_peripherals`.
    RetrievePeripherals(Vec<DeviceId>),
    /// `retrieve_connected_peripherals`.
    RetrieveConnectedPeripherals(Vec<Uuid>),
    /// `register_for_connection_events`.
    RegisterForConnectionEvents(ConnectionEventOptions),
    /// `start_advertising`.
    StartAdvertising(AdvertisingData),
    /// `stop_advertising`.
    StopAdvertising,
}

#[derive(Default)]
struct MockState {
    peripherals: HashMap<DeviceId, MockPeripheral>,
    connected: HashSet<DeviceId>,
    notifying: HashSet<(DeviceId, AttributeKey)>,
    commands: Vec<MockCommand>,
    holding: bool,
    held: Vec<TransportEvent>,
    scanning: bool,
    advertising: bool,
    advertising_error: Option<NativeError>,
}

/// A scriptable in-memory [`Transport`].
pub struct MockTransport {
    sink: EventSink,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a mock and the event source to hand to
    /// [`CentralSession::new`](crate::CentralSession::new).
    ///
    /// The radio starts in [`RadioState::Unknown`]; call
    /// [`power_on`](Self::power_on) before issuing operations.
    pub fn new() -> (Arc<Self>, EventSource) {
        let (sink, source) = events::channel();
        let transport = Arc::new(Self {
            sink,
            state: Mutex::new(MockState::default()),
        });
        (transport, source)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .expect("mock state lock poisoned - a thread panicked while holding the lock")
    }

    /// Deliver `event` now, or queue it while holding.
    fn respond(&self, state: &mut MockState, event: TransportEvent) {
        if state.holding {
            state.held.push(event);
        } else {
            trace!(?event, "Mock responding");
            self.sink.send(event);
        }
    }

    // --- Scripting ---

    /// Add or replace a simulated peripheral.
    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.state().peripherals.insert(peripheral.id, peripheral);
    }

    /// Remove a simulated peripheral. Later connects to it get no response.
    pub fn remove_peripheral(&self, id: DeviceId) {
        let mut state = self.state();
        state.peripherals.remove(&id);
        state.connected.remove(&id);
    }

    /// Replace the value of a characteristic without notifying.
    pub fn set_value(&self, device: DeviceId, key: AttributeKey, value: impl Into<Bytes>) {
        if let Some(characteristic) = self
            .state()
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
        {
            characteristic.value = value.into();
        }
    }

    /// Fail the next advertising starts with `error`, or succeed with `None`.
    pub fn set_advertising_error(&self, error: Option<NativeError>) {
        self.state().advertising_error = error;
    }

    /// Queue responses instead of delivering them.
    pub fn hold(&self) {
        self.state().holding = true;
    }

    /// Deliver queued responses in order and stop holding.
    pub fn release(&self) {
        let held = {
            let mut state = self.state();
            state.holding = false;
            std::mem::take(&mut state.held)
        };
        for event in held {
            self.sink.send(event);
        }
    }

    /// Number of responses currently queued by [`hold`](Self::hold).
    pub fn held_count(&self) -> usize {
        self.state().held.len()
    }

    /// Deliver an arbitrary event, bypassing holding.
    pub fn emit(&self, event: TransportEvent) {
        self.sink.send(event);
    }

    /// Change the radio state. Leaving powered-on drops every link, the scan
    /// and advertising, as the platform does.
    pub fn set_radio_state(&self, radio: RadioState) {
        if !radio.is_powered_on() {
            let mut state = self.state();
            state.connected.clear();
            state.notifying.clear();
            state.scanning = false;
            state.advertising = false;
        }
        self.emit(TransportEvent::RadioStateChanged(radio));
    }

    /// Shorthand for `set_radio_state(RadioState::PoweredOn)`.
    pub fn power_on(&self) {
        self.set_radio_state(RadioState::PoweredOn);
    }

    /// Broadcast one advertisement of a registered peripheral.
    pub fn advertise_peripheral(&self, id: DeviceId, rssi: i16) {
        let advertisement = self
            .state()
            .peripherals
            .get(&id)
            .map(MockPeripheral::advertisement)
            .unwrap_or_default();
        self.emit_discovery(id, advertisement, rssi);
    }

    /// Deliver an advertisement.
    pub fn emit_discovery(&self, device: DeviceId, advertisement: AdvertisementData, rssi: i16) {
        self.emit(TransportEvent::DeviceDiscovered {
            device,
            advertisement,
            rssi,
        });
    }

    /// Deliver a value update as a notification.
    pub fn notify(&self, device: DeviceId, key: AttributeKey, value: impl Into<Bytes>) {
        let value = value.into();
        if let Some(characteristic) = self
            .state()
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
        {
            characteristic.value = value.clone();
        }
        self.emit(TransportEvent::ValueUpdated {
            device,
            characteristic: key,
            value: Some(value),
            error: None,
        });
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, device: DeviceId, error: Option<NativeError>) {
        {
            let mut state = self.state();
            state.connected.remove(&device);
            state.notifying.retain(|(id, _)| *id != device);
        }
        self.emit(TransportEvent::Disconnected { device, error });
    }

    // --- Inspection ---

    /// Every command received so far.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.state().commands.clone()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Number of commands accepted by `predicate`.
    pub fn count(&self, predicate: impl Fn(&MockCommand) -> bool) -> usize {
        self.state().commands.iter().filter(|c| predicate(c)).count()
    }

    /// Number of `connect` commands.
    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, MockCommand::Connect(_)))
    }

    /// Number of `discover_services` commands.
    pub fn service_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, MockCommand::DiscoverServices { .. }))
    }

    /// Number of `discover_characteristics` commands.
    pub fn characteristic_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, MockCommand::DiscoverCharacteristics { .. }))
    }

    /// Number of `read_value` commands.
    pub fn read_count(&self) -> usize {
        self.count(|c| matches!(c, MockCommand::Read { .. }))
    }

    /// Whether `device` is connected on the simulated side.
    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.state().connected.contains(&device)
    }

    /// Whether notifications are enabled for `key` on `device`.
    pub fn is_notifying(&self, device: DeviceId, key: AttributeKey) -> bool {
        self.state().notifying.contains(&(device, key))
    }

    /// Whether the simulated peripheral role is advertising.
    pub fn is_advertising(&self) -> bool {
        self.state().advertising
    }

    /// The current value of a characteristic.
    pub fn value(&self, device: DeviceId, key: AttributeKey) -> Option<Bytes> {
        self.state()
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
            .map(|c| c.value.clone())
    }
}

fn not_found(what: &str) -> NativeError {
    NativeError::new(-1, MOCK_ERROR_DOMAIN, format!("{what} not found"))
}

fn filtered(filter: Option<&[Uuid]>) -> Option<Vec<Uuid>> {
    filter.map(<[Uuid]>::to_vec)
}

impl Transport for MockTransport {
    fn start_scan(&self, services: &[Uuid], options: &ScanOptions) {
        let mut state = self.state();
        state.commands.push(MockCommand::StartScan {
            services: services.to_vec(),
            options: options.clone(),
        });
        state.scanning = true;
    }

    fn stop_scan(&self) {
        let mut state = self.state();
        state.commands.push(MockCommand::StopScan);
        state.scanning = false;
    }

    fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn connect(&self, device: DeviceId, _options: &ConnectOptions) {
        let mut state = self.state();
        state.commands.push(MockCommand::Connect(device));
        let Some(peripheral) = state.peripherals.get(&device) else {
            // Unknown peripherals never answer, like an out-of-range device.
            return;
        };
        let event = match peripheral.connect_error.clone() {
            Some(error) => TransportEvent::FailedToConnect {
                device,
                error: Some(error),
            },
            None => {
                state.connected.insert(device);
                TransportEvent::Connected { device }
            }
        };
        self.respond(&mut state, event);
    }

    fn cancel_connection(&self, device: DeviceId) {
        let mut state = self.state();
        state.commands.push(MockCommand::CancelConnection(device));
        state.connected.remove(&device);
        state.notifying.retain(|(id, _)| *id != device);
        self.respond(
            &mut state,
            TransportEvent::Disconnected {
                device,
                error: None,
            },
        );
    }

    fn discover_services(&self, device: DeviceId, services: Option<&[Uuid]>) {
        let mut state = self.state();
        state.commands.push(MockCommand::DiscoverServices {
            device,
            filter: filtered(services),
        });
        let result = match state.peripherals.get(&device) {
            None => Err(not_found("peripheral")),
            Some(peripheral) => match &peripheral.discovery_error {
                Some(error) => Err(error.clone()),
                None => Ok(peripheral
                    .services
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| services.is_none_or(|wanted| wanted.contains(&s.uuid)))
                    .map(|(i, s)| Service::new(device, s.uuid, MockPeripheral::service_handle(i)))
                    .collect()),
            },
        };
        let (services, error) = match result {
            Ok(services) => (services, None),
            Err(error) => (Vec::new(), Some(error)),
        };
        self.respond(
            &mut state,
            TransportEvent::ServicesDiscovered {
                device,
                services,
                error,
            },
        );
    }

    fn discover_characteristics(&self, service: &Service, characteristics: Option<&[Uuid]>) {
        let mut state = self.state();
        let device = service.device;
        state.commands.push(MockCommand::DiscoverCharacteristics {
            device,
            service: service.uuid,
            filter: filtered(characteristics),
        });
        let result = match state
            .peripherals
            .get(&device)
            .and_then(|p| p.find_service(service.uuid))
        {
            None => Err(not_found("service")),
            Some((index, mock)) => match &mock.discovery_error {
                Some(error) => Err(error.clone()),
                None => Ok(mock
                    .characteristics
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| characteristics.is_none_or(|wanted| wanted.contains(&c.uuid)))
                    .map(|(i, c)| {
                        Characteristic::new(
                            device,
                            service.uuid,
                            c.uuid,
                            MockPeripheral::service_handle(index) + i as u16 + 1,
                            c.properties,
                        )
                    })
                    .collect()),
            },
        };
        let (characteristics, error) = match result {
            Ok(characteristics) => (characteristics, None),
            Err(error) => (Vec::new(), Some(error)),
        };
        self.respond(
            &mut state,
            TransportEvent::CharacteristicsDiscovered {
                device,
                service: service.uuid,
                characteristics,
                error,
            },
        );
    }

    fn read_value(&self, characteristic: &Characteristic) {
        let mut state = self.state();
        let device = characteristic.device;
        let key = characteristic.key();
        state.commands.push(MockCommand::Read { device, key });
        let (value, error) = match state
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
        {
            None => (None, Some(not_found("characteristic"))),
            Some(mock) => match &mock.read_error {
                Some(error) => (None, Some(error.clone())),
                None => (Some(mock.value.clone()), None),
            },
        };
        self.respond(
            &mut state,
            TransportEvent::ValueUpdated {
                device,
                characteristic: key,
                value,
                error,
            },
        );
    }

    fn write_value(&self, characteristic: &Characteristic, value: &[u8], write_type: WriteType) {
        let mut state = self.state();
        let device = characteristic.device;
        let key = characteristic.key();
        state.commands.push(MockCommand::Write {
            device,
            key,
            value: Bytes::copy_from_slice(value),
            write_type,
        });
        let error = match state
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
        {
            None => Some(not_found("characteristic")),
            Some(mock) => match &mock.write_error {
                Some(error) => Some(error.clone()),
                None => {
                    mock.value = Bytes::copy_from_slice(value);
                    None
                }
            },
        };
        if write_type == WriteType::WithResponse {
            self.respond(
                &mut state,
                TransportEvent::WriteAcknowledged {
                    device,
                    characteristic: key,
                    error,
                },
            );
        }
    }

    fn set_notify(&self, characteristic: &Characteristic, enabled: bool) {
        let mut state = self.state();
        let device = characteristic.device;
        let key = characteristic.key();
        state.commands.push(MockCommand::SetNotify {
            device,
            key,
            enabled,
        });
        let supported = state
            .peripherals
            .get_mut(&device)
            .and_then(|p| p.find_characteristic_mut(key))
            .map(|c| c.properties.can_notify());
        let event = match supported {
            Some(true) => {
                if enabled {
                    state.notifying.insert((device, key));
                } else {
                    state.notifying.remove(&(device, key));
                }
                TransportEvent::NotificationStateChanged {
                    device,
                    characteristic: key,
                    enabled,
                    error: None,
                }
            }
            Some(false) => TransportEvent::NotificationStateChanged {
                device,
                characteristic: key,
                enabled: false,
                error: Some(NativeError::new(
                    6,
                    "CBATTErrorDomain",
                    "The request is not supported.",
                )),
            },
            None => TransportEvent::NotificationStateChanged {
                device,
                characteristic: key,
                enabled: false,
                error: Some(not_found("characteristic")),
            },
        };
        self.respond(&mut state, event);
    }

    fn retrieve_peripherals(&self, ids: &[DeviceId]) -> Vec<DeviceId> {
        let mut state = self.state();
        state
            .commands
            .push(MockCommand::RetrievePeripherals(ids.to_vec()));
        ids.iter()
            .copied()
            .filter(|id| state.peripherals.contains_key(id))
            .collect()
    }

    fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<DeviceId> {
        let mut state = self.state();
        state
            .commands
            .push(MockCommand::RetrieveConnectedPeripherals(services.to_vec()));
        let mut found: Vec<DeviceId> = state
            .connected
            .iter()
            .copied()
            .filter(|id| {
                state.peripherals.get(id).is_some_and(|p| {
                    services.is_empty() || p.services.iter().any(|s| services.contains(&s.uuid))
                })
            })
            .collect();
        found.sort_by_key(|id| id.uuid());
        found
    }

    fn register_for_connection_events(&self, options: &ConnectionEventOptions) {
        self.state()
            .commands
            .push(MockCommand::RegisterForConnectionEvents(options.clone()));
    }

    fn start_advertising(&self, data: &AdvertisingData) {
        let mut state = self.state();
        state
            .commands
            .push(MockCommand::StartAdvertising(data.clone()));
        let error = state.advertising_error.clone();
        state.advertising = error.is_none();
        self.respond(&mut state, TransportEvent::AdvertisingStarted { error });
    }

    fn stop_advertising(&self) {
        let mut state = self.state();
        state.commands.push(MockCommand::StopAdvertising);
        state.advertising = false;
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MockTransport")
            .field("peripherals", &state.peripherals.len())
            .field("connected", &state.connected.len())
            .field("commands", &state.commands.len())
            .field("holding", &state.holding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleplex_types::uuids;

    fn device() -> DeviceId {
        DeviceId::new(Uuid::from_u128(0xAB))
    }

    fn battery_peripheral() -> MockPeripheral {
        MockPeripheral::new(device()).name("Sensor").service(
            MockService::new(uuids::BATTERY_SERVICE)
                .characteristic(MockCharacteristic::notifying(uuids::BATTERY_LEVEL, vec![90])),
        )
    }

    fn battery_level() -> Characteristic {
        Characteristic::new(
            device(),
            uuids::BATTERY_SERVICE,
            uuids::BATTERY_LEVEL,
            0x101,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        )
    }

    #[tokio::test]
    async fn test_connect_known_peripheral_responds() {
        let (mock, mut events) = MockTransport::new();
        mock.add_peripheral(battery_peripheral());
        mock.connect(device(), &ConnectOptions::new());

        assert_eq!(
            events.receiver.recv().await,
            Some(TransportEvent::Connected { device: device() })
        );
        assert!(mock.is_connected(device()));
        assert_eq!(mock.connect_count(), 1);
    }

    #[test]
    fn test_connect_unknown_peripheral_is_silent() {
        let (mock, mut events) = MockTransport::new();
        mock.connect(device(), &ConnectOptions::new());
        assert!(events.receiver.try_recv().is_err());
    }

    #[test]
    fn test_hold_queues_until_release() {
        let (mock, mut events) = MockTransport::new();
        mock.add_peripheral(battery_peripheral());
        mock.hold();
        mock.read_value(&battery_level());
        assert_eq!(mock.held_count(), 1);
        assert!(events.receiver.try_recv().is_err());

        mock.release();
        match events.receiver.try_recv() {
            Ok(TransportEvent::ValueUpdated { value, error, .. }) => {
                assert_eq!(value, Some(Bytes::from_static(&[90])));
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_filtered_service_discovery() {
        let (mock, mut events) = MockTransport::new();
        mock.add_peripheral(
            battery_peripheral().service(MockService::new(uuids::DEVICE_INFO_SERVICE)),
        );
        mock.discover_services(device(), Some(&[uuids::DEVICE_INFO_SERVICE]));
        match events.receiver.try_recv() {
            Ok(TransportEvent::ServicesDiscovered { services, error, .. }) => {
                assert!(error.is_none());
                assert_eq!(services.len(), 1);
                assert_eq!(services[0].uuid, uuids::DEVICE_INFO_SERVICE);
                assert_eq!(services[0].handle, 0x200);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_set_notify_on_plain_characteristic_fails() {
        let (mock, mut events) = MockTransport::new();
        mock.add_peripheral(MockPeripheral::new(device()).service(
            MockService::new(uuids::DEVICE_INFO_SERVICE)
                .characteristic(MockCharacteristic::readable(uuids::MODEL_NUMBER, "M1")),
        ));
        let model = Characteristic::new(
            device(),
            uuids::DEVICE_INFO_SERVICE,
            uuids::MODEL_NUMBER,
            0x101,
            CharacteristicProperties::READ,
        );
        mock.set_notify(&model, true);
        match events.receiver.try_recv() {
            Ok(TransportEvent::NotificationStateChanged { enabled, error, .. }) => {
                assert!(!enabled);
                assert!(error.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!mock.is_notifying(device(), model.key()));
    }

    #[test]
    fn test_write_without_response_sends_no_ack() {
        let (mock, mut events) = MockTransport::new();
        mock.add_peripheral(MockPeripheral::new(device()).service(
            MockService::new(uuids::BATTERY_SERVICE)
                .characteristic(MockCharacteristic::writable(uuids::BATTERY_LEVEL)),
        ));
        let level = battery_level();
        mock.write_value(&level, &[1, 2], WriteType::WithoutResponse);
        assert!(events.receiver.try_recv().is_err());
        assert_eq!(
            mock.value(device(), level.key()),
            Some(Bytes::from_static(&[1, 2]))
        );
    }
}
