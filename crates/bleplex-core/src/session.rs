//! Per-device session.
//!
//! A [`DeviceSession`] is the single live handle for one physical peripheral.
//! It owns the connection state machine, the service and characteristic
//! caches, and the in-flight reads, and it turns the shared, unlabelled
//! callback stream into per-call results.
//!
//! Every operation that starts hardware work does so under the session's state
//! lock: it subscribes to the completion channel, issues the command and stores
//! the shared pending future before releasing the lock. The dispatch task takes
//! the same lock to apply an event and publish it, so a caller either attaches
//! to an operation before its completion is published or sees the effect of
//! that completion in the cached state.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bleplex_types::{
    Attribute, AttributeKey, Characteristic, DeviceId, FromLeBytes, Service, WriteType,
};

use crate::context::Context;
use crate::correlation::{Interrupts, match_stream, next_match};
use crate::error::{Error, NativeError, Result};
use crate::events::{
    CharacteristicsEvent, LinkEvent, NotifyEvent, Sequenced, ServicesEvent, ValueEvent,
    WriteEvent,
};
use crate::options::ConnectOptions;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Connection state machine.
enum Link {
    Disconnected,
    Connecting {
        attempt: u64,
        pending: SharedResult<()>,
    },
    Connected,
    Disconnecting(Shared<BoxFuture<'static, ()>>),
}

/// Discovery cache for one collection of attributes.
enum Cache<T> {
    NotFetched,
    Fetching {
        pending: SharedResult<Vec<T>>,
        filter: Option<Vec<Uuid>>,
    },
    /// `complete` is set once an unfiltered discovery has populated `items`.
    Fetched { items: Vec<T>, complete: bool },
}

enum Lookup<T> {
    Hit(Vec<T>),
    Pending {
        pending: SharedResult<Vec<T>>,
        covers: bool,
    },
    Miss,
}

impl<T: Attribute + Clone> Cache<T> {
    fn lookup(&self, filter: Option<&[Uuid]>) -> Lookup<T> {
        match self {
            Cache::NotFetched => Lookup::Miss,
            Cache::Fetching {
                pending,
                filter: pending_filter,
            } => Lookup::Pending {
                pending: pending.clone(),
                covers: covers(pending_filter.as_deref(), filter),
            },
            Cache::Fetched { items, complete } => {
                let present = *complete
                    || filter.is_some_and(|wanted| {
                        wanted
                            .iter()
                            .all(|uuid| items.iter().any(|item| item.uuid() == *uuid))
                    });
                if present {
                    Lookup::Hit(select(items, filter))
                } else {
                    Lookup::Miss
                }
            }
        }
    }

    fn complete(&mut self, result: &std::result::Result<Vec<T>, NativeError>) {
        *self = match result {
            Ok(items) => {
                let complete = match self {
                    Cache::Fetching { filter, .. } => filter.is_none(),
                    Cache::Fetched { complete, .. } => *complete,
                    Cache::NotFetched => false,
                };
                Cache::Fetched {
                    items: items.clone(),
                    complete,
                }
            }
            Err(_) => Cache::NotFetched,
        };
    }

    fn items(&self) -> Option<Vec<T>> {
        match self {
            Cache::Fetched { items, .. } => Some(items.clone()),
            _ => None,
        }
    }
}

/// Whether a discovery filtered by `pending` returns everything `wanted` asks for.
fn covers(pending: Option<&[Uuid]>, wanted: Option<&[Uuid]>) -> bool {
    match (pending, wanted) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(pending), Some(wanted)) => wanted.iter().all(|uuid| pending.contains(uuid)),
    }
}

fn select<T: Attribute + Clone>(items: &[T], filter: Option<&[Uuid]>) -> Vec<T> {
    match filter {
        None => items.to_vec(),
        Some(wanted) => items
            .iter()
            .filter(|item| wanted.contains(&item.uuid()))
            .cloned()
            .collect(),
    }
}

/// An empty filter means "everything".
fn normalize(filter: Option<&[Uuid]>) -> Option<&[Uuid]> {
    filter.filter(|uuids| !uuids.is_empty())
}

struct SessionState {
    link: Link,
    attempts: u64,
    services: Cache<Service>,
    characteristics: HashMap<Uuid, Cache<Characteristic>>,
    reads: HashMap<AttributeKey, SharedResult<Bytes>>,
    notify_observers: HashMap<AttributeKey, usize>,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            link: Link::Disconnected,
            attempts: 0,
            services: Cache::NotFetched,
            characteristics: HashMap::new(),
            reads: HashMap::new(),
            notify_observers: HashMap::new(),
            local_name: None,
            rssi: None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected)
    }
}

struct SessionInner {
    id: DeviceId,
    ctx: Arc<Context>,
    connected: watch::Sender<bool>,
    state: Mutex<SessionState>,
}

/// Shared handle to the session of one peripheral.
///
/// Cloning is cheap and every clone refers to the same session; equality is
/// identity of the underlying session, not of the device id.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

enum ConnectStep {
    Teardown,
    AwaitDisconnect(Shared<BoxFuture<'static, ()>>),
    Attach(SharedResult<()>),
}

impl DeviceSession {
    pub(crate) fn new(id: DeviceId, ctx: Arc<Context>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                ctx,
                connected: watch::Sender::new(false),
                state: Mutex::new(SessionState::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .expect("session state lock poisoned - a thread panicked while holding the lock")
    }

    /// The peripheral's identity.
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Whether both handles refer to the same session.
    pub fn ptr_eq(&self, other: &DeviceSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Last advertised local name.
    pub fn local_name(&self) -> Option<String> {
        self.state().local_name.clone()
    }

    /// Last received signal strength, in dBm.
    pub fn rssi(&self) -> Option<i16> {
        self.state().rssi
    }

    /// Whether the link is up.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Connection state: the current value first, then every change.
    pub fn observe_connection_state(&self) -> WatchStream<bool> {
        WatchStream::new(self.inner.connected.subscribe())
    }

    /// Cached services, if a discovery has completed since the last connect.
    pub fn cached_services(&self) -> Option<Vec<Service>> {
        self.state().services.items()
    }

    /// Cached characteristics of `service`, if discovered since the last connect.
    pub fn cached_characteristics(&self, service: Uuid) -> Option<Vec<Characteristic>> {
        self.state()
            .characteristics
            .get(&service)
            .and_then(Cache::items)
    }

    fn ensure_ready(&self, state: &SessionState) -> Result<()> {
        self.inner.ctx.ensure_powered_on()?;
        if state.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn ensure_owned(&self, device: DeviceId) -> Result<()> {
        if device == self.id() {
            Ok(())
        } else {
            Err(Error::InvalidData(format!(
                "attribute belongs to {}, not {}",
                device,
                self.id()
            )))
        }
    }

    fn interrupts(&self) -> Interrupts {
        self.inner
            .ctx
            .interrupts(Some(self.inner.connected.subscribe()))
    }

    fn set_link(&self, state: &mut SessionState, link: Link) {
        let connected = matches!(link, Link::Connected);
        state.link = link;
        self.inner.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    fn reset(&self, state: &mut SessionState) {
        self.set_link(state, Link::Disconnected);
        state.services = Cache::NotFetched;
        state.characteristics.clear();
        state.reads.clear();
    }

    // --- Connection ---

    /// Connect, or reconnect if already connected.
    ///
    /// A session that is already connected is cleanly disconnected first and
    /// then connected again. A second caller while an attempt is pending
    /// attaches to that attempt instead of issuing another connect. Resolves
    /// once the link is up.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.id()))]
    pub async fn connect(&self, options: ConnectOptions) -> Result<DeviceSession> {
        let mut torn_down = false;
        loop {
            let step = {
                let mut state = self.state();
                self.inner.ctx.ensure_powered_on()?;
                match &state.link {
                    Link::Connected if torn_down => return Ok(self.clone()),
                    Link::Connected => ConnectStep::Teardown,
                    Link::Disconnecting(pending) => ConnectStep::AwaitDisconnect(pending.clone()),
                    Link::Connecting { pending, .. } => {
                        debug!("Attaching to pending connection attempt");
                        ConnectStep::Attach(pending.clone())
                    }
                    Link::Disconnected => ConnectStep::Attach(self.start_connect(&mut state, &options)),
                }
            };

            match step {
                ConnectStep::Teardown => {
                    info!("Already connected; reconnecting");
                    torn_down = true;
                    self.disconnect().await;
                }
                ConnectStep::AwaitDisconnect(pending) => pending.await,
                ConnectStep::Attach(pending) => {
                    pending.await?;
                    info!("Connected");
                    return Ok(self.clone());
                }
            }
        }
    }

    fn start_connect(&self, state: &mut SessionState, options: &ConnectOptions) -> SharedResult<()> {
        let ctx = Arc::clone(&self.inner.ctx);
        let device = self.id();
        let weak = Arc::downgrade(&self.inner);

        state.attempts += 1;
        let attempt = state.attempts;
        let mut rx = ctx.bus.links.subscribe();
        let mut interrupts = ctx.interrupts(None);
        let timeout = options.timeout.or_else(|| ctx.config.connect_timeout());

        info!(attempt, timeout = ?timeout, "Connecting");
        ctx.transport.connect(device, options);

        let pending = async move {
            let mut matcher = |msg: &Sequenced<LinkEvent>| match &msg.event {
                LinkEvent::Connected(id) if *id == device => Some(Ok(())),
                LinkEvent::FailedToConnect(id, cause) | LinkEvent::Disconnected(id, cause)
                    if *id == device =>
                {
                    Some(Err(Error::ConnectionFailed {
                        cause: cause.clone(),
                    }))
                }
                _ => None,
            };
            let wait = next_match(&mut rx, &mut interrupts, &mut matcher);
            let result = match timeout {
                Some(duration) => match tokio::time::timeout(duration, wait).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%device, ?duration, "Connection attempt timed out; cancelling");
                        ctx.transport.cancel_connection(device);
                        Err(Error::timeout("connect", duration))
                    }
                },
                None => wait.await,
            };

            let Some(inner) = weak.upgrade() else {
                return result;
            };
            let session = DeviceSession { inner };
            let mut state = session.state();
            match result {
                // The event alone is not enough: a disconnect issued meanwhile
                // keeps the link down.
                Ok(()) if !state.is_connected() => {
                    debug!(%device, "Connected event arrived after the attempt was abandoned");
                    Err(Error::ConnectionFailed { cause: None })
                }
                Ok(()) => Ok(()),
                Err(err) => {
                    if matches!(state.link, Link::Connecting { attempt: current, .. } if current == attempt)
                    {
                        session.set_link(&mut state, Link::Disconnected);
                    }
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        state.link = Link::Connecting {
            attempt,
            pending: pending.clone(),
        };
        pending
    }

    /// Disconnect. Never fails.
    ///
    /// Resolves on the matching disconnect event, or immediately when there is
    /// no link to tear down.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.id()))]
    pub async fn disconnect(&self) {
        let pending = {
            let mut state = self.state();
            match &state.link {
                Link::Disconnected => return,
                Link::Disconnecting(pending) => pending.clone(),
                Link::Connecting { .. } | Link::Connected => {
                    let ctx = &self.inner.ctx;
                    if ctx.ensure_powered_on().is_err() {
                        // Radio loss tears every link down on its own.
                        return;
                    }
                    let device = self.id();
                    let mut rx = ctx.bus.links.subscribe();
                    let mut interrupts = ctx.interrupts(None);
                    info!("Disconnecting");
                    ctx.transport.cancel_connection(device);

                    let pending = async move {
                        let _ = next_match(&mut rx, &mut interrupts, &mut |msg: &Sequenced<LinkEvent>| {
                            matches!(
                                &msg.event,
                                LinkEvent::Disconnected(id, _) | LinkEvent::FailedToConnect(id, _)
                                    if *id == device
                            )
                            .then_some(Ok(()))
                        })
                        .await;
                    }
                    .boxed()
                    .shared();
                    self.set_link(&mut state, Link::Disconnecting(pending.clone()));
                    pending
                }
            }
        };
        pending.await;
        debug!("Disconnected");
    }

    // --- Discovery ---

    /// Discover services, optionally restricted to `filter`.
    ///
    /// Served from the cache when it already holds what was asked for. Callers
    /// arriving while a covering discovery is in flight share its result; at
    /// most one hardware discovery runs per device at a time.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.id()))]
    pub async fn discover_services(&self, filter: Option<&[Uuid]>) -> Result<Vec<Service>> {
        let filter = normalize(filter);
        self.inner
            .ctx
            .with_operation_timeout("discover_services", self.resolve_services(filter))
            .await
    }

    async fn resolve_services(&self, filter: Option<&[Uuid]>) -> Result<Vec<Service>> {
        loop {
            let (pending, covers) = {
                let mut state = self.state();
                self.ensure_ready(&state)?;
                match state.services.lookup(filter) {
                    Lookup::Hit(services) => {
                        debug!(count = services.len(), "Service cache hit");
                        return Ok(services);
                    }
                    Lookup::Pending { pending, covers } => (pending, covers),
                    Lookup::Miss => {
                        let pending = self.start_service_discovery(filter);
                        state.services = Cache::Fetching {
                            pending: pending.clone(),
                            filter: filter.map(<[Uuid]>::to_vec),
                        };
                        (pending, true)
                    }
                }
            };
            let result = pending.await;
            if covers {
                return result.map(|services| select(&services, filter));
            }
        }
    }

    fn start_service_discovery(&self, filter: Option<&[Uuid]>) -> SharedResult<Vec<Service>> {
        let ctx = &self.inner.ctx;
        let device = self.id();
        let mut rx = ctx.bus.services.subscribe();
        let mut interrupts = self.interrupts();
        debug!(filter = ?filter, "Discovering services");
        ctx.transport.discover_services(device, filter);

        async move {
            next_match(&mut rx, &mut interrupts, &mut |msg: &Sequenced<ServicesEvent>| {
                (msg.event.device == device).then(|| {
                    msg.event
                        .result
                        .clone()
                        .map_err(Error::ServiceDiscoveryFailed)
                })
            })
            .await
        }
        .boxed()
        .shared()
    }

    /// Discover characteristics of `service`, optionally restricted to `filter`.
    ///
    /// Same caching and sharing rules as [`discover_services`](Self::discover_services),
    /// keyed by service.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.id(), service = %service.uuid))]
    pub async fn discover_characteristics(
        &self,
        service: &Service,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<Characteristic>> {
        self.ensure_owned(service.device)?;
        let filter = normalize(filter);
        self.inner
            .ctx
            .with_operation_timeout(
                "discover_characteristics",
                self.resolve_characteristics(service, filter),
            )
            .await
    }

    async fn resolve_characteristics(
        &self,
        service: &Service,
        filter: Option<&[Uuid]>,
    ) -> Result<Vec<Characteristic>> {
        loop {
            let (pending, covers) = {
                let mut state = self.state();
                self.ensure_ready(&state)?;
                let cache = state
                    .characteristics
                    .entry(service.uuid)
                    .or_insert(Cache::NotFetched);
                match cache.lookup(filter) {
                    Lookup::Hit(characteristics) => {
                        debug!(count = characteristics.len(), "Characteristic cache hit");
                        return Ok(characteristics);
                    }
                    Lookup::Pending { pending, covers } => (pending, covers),
                    Lookup::Miss => {
                        let pending = self.start_characteristic_discovery(service, filter);
                        *cache = Cache::Fetching {
                            pending: pending.clone(),
                            filter: filter.map(<[Uuid]>::to_vec),
                        };
                        (pending, true)
                    }
                }
            };
            let result = pending.await;
            if covers {
                return result.map(|characteristics| select(&characteristics, filter));
            }
        }
    }

    fn start_characteristic_discovery(
        &self,
        service: &Service,
        filter: Option<&[Uuid]>,
    ) -> SharedResult<Vec<Characteristic>> {
        let ctx = &self.inner.ctx;
        let device = self.id();
        let service_uuid = service.uuid;
        let mut rx = ctx.bus.characteristics.subscribe();
        let mut interrupts = self.interrupts();
        debug!(filter = ?filter, "Discovering characteristics");
        ctx.transport.discover_characteristics(service, filter);

        async move {
            next_match(
                &mut rx,
                &mut interrupts,
                &mut |msg: &Sequenced<CharacteristicsEvent>| {
                    (msg.event.device == device && msg.event.service == service_uuid).then(|| {
                        msg.event
                            .result
                            .clone()
                            .map_err(Error::CharacteristicDiscoveryFailed)
                    })
                },
            )
            .await
        }
        .boxed()
        .shared()
    }

    /// Look up a characteristic by UUID, discovering along the path.
    ///
    /// `Ok(None)` when the service or characteristic does not exist.
    pub async fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>> {
        let services = self.discover_services(Some(&[service])).await?;
        let Some(service) = services.into_iter().find(|s| s.uuid == service) else {
            return Ok(None);
        };
        let characteristics = self
            .discover_characteristics(&service, Some(&[characteristic]))
            .await?;
        Ok(characteristics.into_iter().find(|c| c.uuid == characteristic))
    }

    // --- Values ---

    /// Read a characteristic value.
    ///
    /// Callers arriving while a read of the same characteristic is in flight
    /// attach to it and receive the same bytes; the hardware is read once.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.id(), characteristic = %characteristic.uuid))]
    pub async fn read_value(&self, characteristic: &Characteristic) -> Result<Bytes> {
        self.ensure_owned(characteristic.device)?;
        let pending = {
            let mut state = self.state();
            self.ensure_ready(&state)?;
            let key = characteristic.key();
            match state.reads.get(&key) {
                Some(pending) => {
                    debug!("Attaching to in-flight read");
                    pending.clone()
                }
                None => {
                    let pending = self.start_read(characteristic);
                    state.reads.insert(key, pending.clone());
                    pending
                }
            }
        };
        let result = self
            .inner
            .ctx
            .with_operation_timeout("read_value", pending.clone())
            .await;
        if let Err(Error::Timeout { .. }) = result {
            // The next caller issues a fresh read instead of joining this one.
            let mut state = self.state();
            let key = characteristic.key();
            if state.reads.get(&key).is_some_and(|current| current.ptr_eq(&pending)) {
                debug!("Dropping stalled read");
                state.reads.remove(&key);
            }
        }
        result
    }

    fn start_read(&self, characteristic: &Characteristic) -> SharedResult<Bytes> {
        let ctx = &self.inner.ctx;
        let device = self.id();
        let key = characteristic.key();
        let mut rx = ctx.bus.values.subscribe();
        let mut interrupts = self.interrupts();
        ctx.transport.read_value(characteristic);

        async move {
            next_match(&mut rx, &mut interrupts, &mut |msg: &Sequenced<ValueEvent>| {
                msg.event
                    .is_for(device, key)
                    .then(|| msg.event.result.clone().map_err(Error::ReadFailed))
            })
            .await
        }
        .boxed()
        .shared()
    }

    /// Read a characteristic and decode it as a little-endian `T`.
    pub async fn read_as<T: FromLeBytes>(&self, characteristic: &Characteristic) -> Result<T> {
        let value = self.read_value(characteristic).await?;
        Ok(T::from_le_slice(&value)?)
    }

    /// Write a characteristic value.
    ///
    /// [`WriteType::WithResponse`] resolves on the peripheral's
    /// acknowledgement. [`WriteType::WithoutResponse`] resolves as soon as the
    /// write is issued.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.id(), characteristic = %characteristic.uuid, len = value.len()))]
    pub async fn write_value(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.ensure_owned(characteristic.device)?;
        let device = self.id();
        let key = characteristic.key();
        let (mut rx, mut interrupts) = {
            let state = self.state();
            self.ensure_ready(&state)?;
            let transport = &self.inner.ctx.transport;
            match write_type {
                WriteType::WithoutResponse => {
                    transport.write_value(characteristic, value, write_type);
                    return Ok(());
                }
                WriteType::WithResponse => {
                    let rx = self.inner.ctx.bus.writes.subscribe();
                    let interrupts = self.interrupts();
                    transport.write_value(characteristic, value, write_type);
                    (rx, interrupts)
                }
            }
        };

        let mut matcher = |msg: &Sequenced<WriteEvent>| {
            msg.event
                .is_for(device, key)
                .then(|| msg.event.result.clone().map_err(Error::WriteFailed))
        };
        let acknowledged = next_match(&mut rx, &mut interrupts, &mut matcher);
        self.inner
            .ctx
            .with_operation_timeout("write_value", acknowledged)
            .await
    }

    /// Enable or disable notifications without waiting for the acknowledgement.
    pub fn set_notify(&self, characteristic: &Characteristic, enabled: bool) -> Result<()> {
        self.ensure_owned(characteristic.device)?;
        let state = self.state();
        self.ensure_ready(&state)?;
        self.inner.ctx.transport.set_notify(characteristic, enabled);
        Ok(())
    }

    /// Every value update of `characteristic` from now on.
    ///
    /// Does not enable notifications; values arrive from reads issued by any
    /// caller or from notifications enabled elsewhere. Value events carrying an
    /// error are skipped. Ends with an error when the link or the radio goes
    /// down.
    pub fn observe_value(&self, characteristic: &Characteristic) -> ValueStream {
        let state = self.state();
        if let Err(err) = self
            .ensure_owned(characteristic.device)
            .and_then(|_| self.ensure_ready(&state))
        {
            return ValueStream::failed(err);
        }
        let rx = self.inner.ctx.bus.values.subscribe();
        let stream = match_stream(
            rx,
            self.interrupts(),
            (),
            value_matcher(self.id(), characteristic.key(), 0),
        );
        ValueStream::new(stream.boxed())
    }

    /// Enable notifications and stream every value delivered after the
    /// peripheral acknowledged them.
    ///
    /// A failed acknowledgement ends the stream with
    /// [`Error::CharacteristicDiscoveryFailed`] before any value. Notifications
    /// are disabled again when the last such stream for the characteristic is
    /// dropped.
    pub fn observe_value_with_notification(&self, characteristic: &Characteristic) -> ValueStream {
        let device = self.id();
        let key = characteristic.key();
        let (values, mut acks, mut interrupts, lease) = {
            let mut state = self.state();
            if let Err(err) = self
                .ensure_owned(characteristic.device)
                .and_then(|_| self.ensure_ready(&state))
            {
                return ValueStream::failed(err);
            }
            let values = self.inner.ctx.bus.values.subscribe();
            let acks = self.inner.ctx.bus.notify.subscribe();
            let interrupts = self.interrupts();
            *state.notify_observers.entry(key).or_insert(0) += 1;
            debug!(%device, characteristic = %key, "Enabling notifications");
            self.inner.ctx.transport.set_notify(characteristic, true);
            let lease = NotifyLease {
                session: self.clone(),
                characteristic: characteristic.clone(),
                armed: true,
            };
            (values, acks, interrupts, lease)
        };

        let stream_interrupts = interrupts.clone();
        let enable = async move {
            let mut lease = lease;
            let (seq, ack) = next_match(&mut acks, &mut interrupts, &mut |msg: &Sequenced<NotifyEvent>| {
                msg.event
                    .is_for(device, key)
                    .then(|| Ok((msg.seq, msg.event.result.clone())))
            })
            .await?;
            match ack {
                Ok(_) => Ok(match_stream(
                    values,
                    stream_interrupts,
                    lease,
                    value_matcher(device, key, seq),
                )
                .boxed()),
                Err(native) => {
                    warn!(%device, characteristic = %key, error = %native, "Enabling notifications failed");
                    lease.armed = false;
                    Err(Error::CharacteristicDiscoveryFailed(native))
                }
            }
        };
        ValueStream::new(stream::once(enable).try_flatten().boxed())
    }

    // --- Event application, called by the dispatch task only ---

    pub(crate) fn record_advertisement(&self, local_name: Option<&str>, rssi: i16) {
        let mut state = self.state();
        if let Some(name) = local_name {
            state.local_name = Some(name.to_string());
        }
        state.rssi = Some(rssi);
    }

    pub(crate) fn apply_link(&self, event: LinkEvent) {
        let mut state = self.state();
        match &event {
            LinkEvent::Connected(_) => {
                if !matches!(state.link, Link::Disconnecting(_)) {
                    self.set_link(&mut state, Link::Connected);
                }
            }
            LinkEvent::Disconnected(_, error) => {
                if let Some(error) = error {
                    warn!(device = %self.id(), %error, "Link lost");
                }
                self.reset(&mut state);
            }
            LinkEvent::FailedToConnect(_, _) => {
                if matches!(state.link, Link::Connecting { .. }) {
                    self.set_link(&mut state, Link::Disconnected);
                }
            }
        }
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.links, event);
    }

    pub(crate) fn apply_services(&self, event: ServicesEvent) {
        let mut state = self.state();
        if state.is_connected() {
            state.services.complete(&event.result);
        }
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.services, event);
    }

    pub(crate) fn apply_characteristics(&self, event: CharacteristicsEvent) {
        let mut state = self.state();
        if state.is_connected() {
            state
                .characteristics
                .entry(event.service)
                .or_insert(Cache::NotFetched)
                .complete(&event.result);
        }
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.characteristics, event);
    }

    pub(crate) fn apply_value(&self, event: ValueEvent) {
        let mut state = self.state();
        state.reads.remove(&event.key);
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.values, event);
    }

    pub(crate) fn apply_write(&self, event: WriteEvent) {
        let _state = self.state();
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.writes, event);
    }

    pub(crate) fn apply_notify(&self, event: NotifyEvent) {
        let _state = self.state();
        let bus = &self.inner.ctx.bus;
        bus.publish(&bus.notify, event);
    }

    /// Implicit disconnect after the radio left the powered-on state.
    pub(crate) fn apply_radio_loss(&self) {
        let mut state = self.state();
        self.reset(&mut state);
    }
}

fn value_matcher(
    device: DeviceId,
    key: AttributeKey,
    after: u64,
) -> impl FnMut(&Sequenced<ValueEvent>) -> Option<Result<Bytes>> + Send + 'static {
    move |msg| {
        if msg.seq <= after || !msg.event.is_for(device, key) {
            return None;
        }
        match &msg.event.result {
            Ok(value) => Some(Ok(value.clone())),
            Err(error) => {
                debug!(%device, characteristic = %key, %error, "Skipping failed value update");
                None
            }
        }
    }
}

impl PartialEq for DeviceSession {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for DeviceSession {}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Counts a notification observer; the last one to go disables notifications.
struct NotifyLease {
    session: DeviceSession,
    characteristic: Characteristic,
    armed: bool,
}

impl Drop for NotifyLease {
    fn drop(&mut self) {
        let key = self.characteristic.key();
        let mut state = self.session.state();
        let remaining = match state.notify_observers.get_mut(&key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        state.notify_observers.remove(&key);
        if self.armed
            && state.is_connected()
            && self.session.inner.ctx.ensure_powered_on().is_ok()
        {
            debug!(device = %self.session.id(), characteristic = %key, "Disabling notifications");
            self.session
                .inner
                .ctx
                .transport
                .set_notify(&self.characteristic, false);
        }
    }
}

/// Stream of characteristic values.
///
/// Yields `Ok` values until the link or the radio goes down, then a single
/// `Err` and ends.
pub struct ValueStream {
    inner: BoxStream<'static, Result<Bytes>>,
}

impl ValueStream {
    fn new(inner: BoxStream<'static, Result<Bytes>>) -> Self {
        Self { inner }
    }

    fn failed(err: Error) -> Self {
        Self::new(stream::once(async move { Err::<Bytes, Error>(err) }).boxed())
    }
}

impl Stream for ValueStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(uuid: u128) -> Service {
        Service::new(DeviceId::new(Uuid::from_u128(1)), Uuid::from_u128(uuid), uuid as u16)
    }

    #[test]
    fn test_covers() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(covers(None, None));
        assert!(covers(None, Some(&[a])));
        assert!(!covers(Some(&[a]), None));
        assert!(covers(Some(&[a, b]), Some(&[b])));
        assert!(!covers(Some(&[a]), Some(&[a, b])));
    }

    #[test]
    fn test_normalize_treats_empty_filter_as_none() {
        assert_eq!(normalize(Some(&[])), None);
        let a = [Uuid::from_u128(1)];
        assert_eq!(normalize(Some(&a)), Some(&a[..]));
    }

    #[test]
    fn test_complete_cache_hits_any_filter() {
        let mut cache: Cache<Service> = Cache::NotFetched;
        assert!(matches!(cache.lookup(None), Lookup::Miss));

        cache.complete(&Ok(vec![service(0x180F), service(0x180A)]));
        // Populated without an unfiltered request in flight: not complete.
        assert!(matches!(cache.lookup(None), Lookup::Miss));
        match cache.lookup(Some(&[Uuid::from_u128(0x180F)])) {
            Lookup::Hit(items) => assert_eq!(items, vec![service(0x180F)]),
            _ => panic!("expected hit"),
        }

        cache = Cache::Fetched {
            items: vec![service(0x180F)],
            complete: true,
        };
        match cache.lookup(Some(&[Uuid::from_u128(0x1800)])) {
            Lookup::Hit(items) => assert!(items.is_empty()),
            _ => panic!("complete cache must answer every filter"),
        }
    }

    #[test]
    fn test_failed_discovery_is_not_cached() {
        let mut cache: Cache<Service> = Cache::Fetched {
            items: vec![service(0x180F)],
            complete: true,
        };
        cache.complete(&Err(NativeError::new(3, "test", "failed")));
        assert!(matches!(cache, Cache::NotFetched));
        assert!(cache.items().is_none());
    }
}
