//! The central session: entry point of the session layer.

use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

use bleplex_types::DeviceId;

use crate::advertising::{Advertisement, AdvertisingSlot};
use crate::config::SessionConfig;
use crate::context::Context;
use crate::correlation::match_stream;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{AncsAuthorization, ConnectionEvent, EventSource, RestoredState, Sequenced};
use crate::options::{AdvertisingData, ConnectOptions, ConnectionEventOptions, ScanOptions};
use crate::radio::RadioStateTracker;
use crate::registry::DeviceRegistry;
use crate::scan::{ScanCoordinator, ScanStream};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Owns the transport, the dispatch task and the device registry.
///
/// Dropping the central session stops the dispatch task. Pending operations
/// then fail with [`Error::Deallocated`] and every stream ends. Device session
/// handles stay valid but every operation on them fails the same way.
pub struct CentralSession {
    ctx: Arc<Context>,
    registry: DeviceRegistry,
    scans: Arc<ScanCoordinator>,
    advertising: Arc<AdvertisingSlot>,
    _shutdown: DropGuard,
}

impl CentralSession {
    /// Create a session driving `transport`, whose events arrive on `events`.
    ///
    /// Must be called within a Tokio runtime; the dispatch task is spawned on
    /// it. Fails with [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: EventSource,
        config: SessionConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let ctx = Arc::new(Context::new(transport, config));
        let registry = DeviceRegistry::new(Arc::clone(&ctx));
        let scans = Arc::new(ScanCoordinator::new(Arc::clone(&ctx)));
        let advertising = Arc::new(AdvertisingSlot::new(Arc::clone(&ctx)));

        let dispatcher = Dispatcher {
            ctx: Arc::clone(&ctx),
            registry: registry.clone(),
            scans: Arc::clone(&scans),
            advertising: Arc::clone(&advertising),
        };
        tokio::spawn(dispatcher.run(events));
        info!(
            event_capacity = ctx.config.event_capacity,
            "Central session started"
        );

        Ok(Self {
            _shutdown: ctx.shutdown.clone().drop_guard(),
            ctx,
            registry,
            scans,
            advertising,
        })
    }

    /// Radio power state.
    pub fn radio(&self) -> RadioStateTracker {
        self.ctx.radio.tracker()
    }

    /// The device identity registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// The session for `id`, creating it if needed. Issues no command.
    pub fn device(&self, id: DeviceId) -> DeviceSession {
        self.registry.get_or_create(id)
    }

    /// Forget the session for `id`.
    pub fn evict(&self, id: DeviceId) -> Option<DeviceSession> {
        self.registry.evict(id)
    }

    /// Whether the hardware is scanning.
    pub fn is_scanning(&self) -> bool {
        self.ctx.transport.is_scanning()
    }

    /// Scan for peripherals advertising any of `services`, or every
    /// peripheral when `services` is empty.
    ///
    /// The stream is lazy; see [`ScanStream`].
    pub fn scan(&self, services: &[Uuid], options: ScanOptions) -> ScanStream {
        ScanStream::new(
            services,
            options,
            Arc::clone(&self.ctx),
            self.registry.clone(),
            Arc::clone(&self.scans),
        )
    }

    /// Scan with the filter and options from the configuration.
    pub fn scan_configured(&self) -> ScanStream {
        let scan = &self.ctx.config.scan;
        self.scan(&scan.services, scan.options())
    }

    /// Connect `device`. See [`DeviceSession::connect`].
    pub async fn connect(
        &self,
        device: &DeviceSession,
        options: ConnectOptions,
    ) -> Result<DeviceSession> {
        device.connect(options).await
    }

    /// Disconnect `device`. Never fails.
    pub async fn disconnect(&self, device: &DeviceSession) {
        device.disconnect().await
    }

    /// Sessions for the peripherals among `ids` that the system knows.
    pub fn retrieve(&self, ids: &[DeviceId]) -> Result<Vec<DeviceSession>> {
        self.ctx.ensure_powered_on()?;
        let found = self.ctx.transport.retrieve_peripherals(ids);
        debug!(requested = ids.len(), found = found.len(), "Retrieved peripherals");
        Ok(self.sessions_for(found))
    }

    /// Sessions for peripherals already connected to the system that expose
    /// any of `services`.
    pub fn retrieve_connected(&self, services: &[Uuid]) -> Result<Vec<DeviceSession>> {
        self.ctx.ensure_powered_on()?;
        let found = self.ctx.transport.retrieve_connected_peripherals(services);
        debug!(found = found.len(), "Retrieved connected peripherals");
        Ok(self.sessions_for(found))
    }

    fn sessions_for(&self, ids: Vec<DeviceId>) -> Vec<DeviceSession> {
        ids.into_iter()
            .map(|id| self.registry.get_or_create(id))
            .collect()
    }

    /// Register for system connection events and stream them.
    ///
    /// When `options.peripherals` is non-empty only events for those
    /// peripherals are yielded. Ends with an error on radio loss or teardown.
    pub fn register_for_connection_events(
        &self,
        options: ConnectionEventOptions,
    ) -> BoxStream<'static, Result<ConnectionEvent>> {
        let mut interrupts = self.ctx.interrupts(None);
        if let Err(err) = interrupts.check() {
            return stream::once(async move { Err::<ConnectionEvent, _>(err) }).boxed();
        }
        let rx = self.ctx.bus.connection_events.subscribe();
        info!(
            services = ?options.services,
            peripherals = ?options.peripherals,
            "Registering for connection events"
        );
        self.ctx.transport.register_for_connection_events(&options);

        let peripherals = options.peripherals;
        match_stream(rx, interrupts, (), move |msg: &Sequenced<ConnectionEvent>| {
            let event = msg.event;
            (peripherals.is_empty() || peripherals.contains(&event.device)).then_some(Ok(event))
        })
        .boxed()
    }

    /// State handed back by the system on relaunch.
    ///
    /// Not gated on the radio: restoration is delivered before the radio
    /// reports powered on. Ends when the central session is dropped.
    pub fn observe_restore_state(&self) -> impl Stream<Item = RestoredState> + Send + use<> {
        passthrough(
            BroadcastStream::new(self.ctx.bus.restore.subscribe()),
            self.ctx.shutdown.clone(),
        )
    }

    /// ANCS authorization updates. Ends when the central session is dropped.
    pub fn observe_ancs_authorization(&self) -> impl Stream<Item = AncsAuthorization> + Send + use<> {
        passthrough(
            BroadcastStream::new(self.ctx.bus.ancs.subscribe()),
            self.ctx.shutdown.clone(),
        )
    }

    /// Start peripheral-role advertising.
    ///
    /// Fails with [`Error::AdvertisingInProgress`] while another
    /// [`Advertisement`] is alive.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn advertise(&self, data: AdvertisingData) -> Result<Advertisement> {
        self.advertising.advertise(data).await
    }

    /// Whether an advertisement is active or starting.
    pub fn is_advertising(&self) -> bool {
        self.advertising.is_active()
    }
}

/// Unwrap bus messages until `shutdown` fires. Lagged messages are skipped.
fn passthrough<T>(
    events: BroadcastStream<Sequenced<T>>,
    shutdown: CancellationToken,
) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + 'static,
{
    events
        .filter_map(|msg| async move { msg.ok().map(|msg| msg.event) })
        .take_until(shutdown.cancelled_owned())
}

impl std::fmt::Debug for CentralSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralSession")
            .field("radio", &self.ctx.radio.current())
            .field("devices", &self.registry.len())
            .finish_non_exhaustive()
    }
}
