//! The dispatch task.
//!
//! Drains the transport's event queue in order. For each event it applies the
//! effect on session state first and publishes on the bus second, both under
//! the owning session's lock. It is the only writer of event-driven state.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::advertising::AdvertisingSlot;
use crate::context::Context;
use crate::events::{
    AttributeEvent, CharacteristicsEvent, Discovery, EventSource, LinkEvent, ServicesEvent,
    TransportEvent, into_result,
};
use crate::registry::DeviceRegistry;
use crate::scan::ScanCoordinator;

pub(crate) struct Dispatcher {
    pub ctx: Arc<Context>,
    pub registry: DeviceRegistry,
    pub scans: Arc<ScanCoordinator>,
    pub advertising: Arc<AdvertisingSlot>,
}

impl Dispatcher {
    /// Run until the central session shuts down or the transport drops its sink.
    pub async fn run(self, mut source: EventSource) {
        let shutdown = self.ctx.shutdown.clone();
        debug!("Dispatch task started");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = source.receiver.recv() => event,
            };
            match event {
                Some(event) => self.dispatch(event),
                None => {
                    info!("Transport event source closed");
                    break;
                }
            }
        }
        // Wakes every pending operation with `Deallocated`.
        shutdown.cancel();
        debug!("Dispatch task stopped");
    }

    fn dispatch(&self, event: TransportEvent) {
        trace!(?event, "Dispatching transport event");
        let bus = &self.ctx.bus;
        match event {
            TransportEvent::RadioStateChanged(state) => {
                if self.ctx.radio.apply(state) {
                    for session in self.registry.sessions() {
                        session.apply_radio_loss();
                    }
                    self.scans.reset();
                    self.advertising.reset();
                }
            }
            TransportEvent::DeviceDiscovered {
                device,
                advertisement,
                rssi,
            } => {
                let session = self.registry.get_or_create(device);
                session.record_advertisement(advertisement.local_name.as_deref(), rssi);
                bus.publish(
                    &bus.discovered,
                    Discovery {
                        device,
                        advertisement,
                        rssi,
                    },
                );
            }
            TransportEvent::Connected { device } => {
                self.registry
                    .get_or_create(device)
                    .apply_link(LinkEvent::Connected(device));
            }
            TransportEvent::Disconnected { device, error } => {
                self.link(LinkEvent::Disconnected(device, error));
            }
            TransportEvent::FailedToConnect { device, error } => {
                self.link(LinkEvent::FailedToConnect(device, error));
            }
            TransportEvent::ServicesDiscovered {
                device,
                services,
                error,
            } => {
                let event = ServicesEvent {
                    device,
                    result: into_result(services, error),
                };
                match self.registry.get(device) {
                    Some(session) => session.apply_services(event),
                    None => {
                        bus.publish(&bus.services, event);
                    }
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                device,
                service,
                characteristics,
                error,
            } => {
                let event = CharacteristicsEvent {
                    device,
                    service,
                    result: into_result(characteristics, error),
                };
                match self.registry.get(device) {
                    Some(session) => session.apply_characteristics(event),
                    None => {
                        bus.publish(&bus.characteristics, event);
                    }
                }
            }
            TransportEvent::ValueUpdated {
                device,
                characteristic,
                value,
                error,
            } => {
                let event = AttributeEvent {
                    device,
                    key: characteristic,
                    result: into_result(value.unwrap_or_else(Bytes::new), error),
                };
                match self.registry.get(device) {
                    Some(session) => session.apply_value(event),
                    None => {
                        bus.publish(&bus.values, event);
                    }
                }
            }
            TransportEvent::WriteAcknowledged {
                device,
                characteristic,
                error,
            } => {
                let event = AttributeEvent {
                    device,
                    key: characteristic,
                    result: into_result((), error),
                };
                match self.registry.get(device) {
                    Some(session) => session.apply_write(event),
                    None => {
                        bus.publish(&bus.writes, event);
                    }
                }
            }
            TransportEvent::NotificationStateChanged {
                device,
                characteristic,
                enabled,
                error,
            } => {
                let event = AttributeEvent {
                    device,
                    key: characteristic,
                    result: into_result(enabled, error),
                };
                match self.registry.get(device) {
                    Some(session) => session.apply_notify(event),
                    None => {
                        bus.publish(&bus.notify, event);
                    }
                }
            }
            TransportEvent::RestoreState(restored) => {
                info!(devices = restored.devices.len(), "Restoring state");
                for device in &restored.devices {
                    self.registry.get_or_create(*device);
                }
                bus.publish(&bus.restore, restored);
            }
            TransportEvent::ConnectionEvent(event) => {
                self.registry.get_or_create(event.device);
                bus.publish(&bus.connection_events, event);
            }
            TransportEvent::AncsAuthorizationChanged(update) => {
                bus.publish(&bus.ancs, update);
            }
            TransportEvent::AdvertisingStarted { error } => {
                bus.publish(&bus.advertising, into_result((), error));
            }
        }
    }

    fn link(&self, event: LinkEvent) {
        match self.registry.get(event.device()) {
            Some(session) => session.apply_link(event),
            None => {
                let bus = &self.ctx.bus;
                bus.publish(&bus.links, event);
            }
        }
    }
}
