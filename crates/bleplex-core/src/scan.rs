//! Scanning.
//!
//! Any number of [`ScanStream`]s can be active; they share one hardware scan.
//! The hardware filter is the union of the active streams' service filters, or
//! no filter at all as soon as one stream is unfiltered. Each stream still
//! applies its own filter to what it yields. The hardware scan starts when the
//! first stream is polled and stops when the last one is dropped.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context as TaskContext, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use bleplex_types::AdvertisementData;

use crate::context::Context;
use crate::correlation::match_stream;
use crate::error::Result;
use crate::events::{Discovery, Sequenced};
use crate::options::ScanOptions;
use crate::registry::DeviceRegistry;
use crate::session::DeviceSession;

/// One advertisement, resolved to the device's session.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// The advertising device's session; the same instance for every result
    /// from that device.
    pub session: DeviceSession,
    /// Decoded advertisement fields.
    pub advertisement: AdvertisementData,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HardwareScan {
    services: Vec<Uuid>,
    options: ScanOptions,
}

#[derive(Default)]
struct ScanState {
    next_id: u64,
    active: HashMap<u64, (Vec<Uuid>, ScanOptions)>,
    hardware: Option<HardwareScan>,
}

impl ScanState {
    /// Hardware scan covering every active subscription.
    fn desired(&self) -> Option<HardwareScan> {
        if self.active.is_empty() {
            return None;
        }
        let unfiltered = self.active.values().any(|(services, _)| services.is_empty());
        let mut services: Vec<Uuid> = if unfiltered {
            Vec::new()
        } else {
            self.active
                .values()
                .flat_map(|(services, _)| services.iter().copied())
                .collect()
        };
        services.sort();
        services.dedup();

        let mut solicited: Vec<Uuid> = self
            .active
            .values()
            .flat_map(|(_, options)| options.solicited_services.iter().copied())
            .collect();
        solicited.sort();
        solicited.dedup();

        Some(HardwareScan {
            services,
            options: ScanOptions {
                allow_duplicates: self.active.values().any(|(_, o)| o.allow_duplicates),
                solicited_services: solicited,
            },
        })
    }
}

/// Tracks scan subscriptions and drives the hardware scan.
pub(crate) struct ScanCoordinator {
    ctx: Arc<Context>,
    state: Mutex<ScanState>,
}

impl ScanCoordinator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            state: Mutex::new(ScanState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state
            .lock()
            .expect("scan state lock poisoned - a thread panicked while holding the lock")
    }

    fn register(self: &Arc<Self>, services: Vec<Uuid>, options: ScanOptions) -> ScanLease {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(id, (services, options));
        self.sync(&mut state);
        ScanLease {
            id,
            coordinator: Arc::clone(self),
        }
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state();
        if state.active.remove(&id).is_some() {
            self.sync(&mut state);
        }
    }

    /// The hardware stopped scanning on its own (radio loss).
    pub fn reset(&self) {
        let mut state = self.state();
        state.active.clear();
        state.hardware = None;
    }

    fn sync(&self, state: &mut ScanState) {
        let desired = state.desired();
        if desired == state.hardware {
            return;
        }
        if self.ctx.radio.current().is_powered_on() {
            match &desired {
                Some(scan) => {
                    info!(services = ?scan.services, "Starting hardware scan");
                    self.ctx.transport.start_scan(&scan.services, &scan.options);
                }
                None => {
                    info!("Stopping hardware scan");
                    self.ctx.transport.stop_scan();
                }
            }
        }
        state.hardware = desired;
    }
}

/// Keeps one subscription registered with the coordinator.
struct ScanLease {
    id: u64,
    coordinator: Arc<ScanCoordinator>,
}

impl Drop for ScanLease {
    fn drop(&mut self) {
        self.coordinator.unregister(self.id);
    }
}

struct ScanRequest {
    services: Vec<Uuid>,
    options: ScanOptions,
    ctx: Arc<Context>,
    registry: DeviceRegistry,
    coordinator: Arc<ScanCoordinator>,
}

impl ScanRequest {
    fn start(self) -> BoxStream<'static, Result<ScanResult>> {
        let mut interrupts = self.ctx.interrupts(None);
        if let Err(err) = interrupts.check() {
            return stream::once(async move { Err::<ScanResult, _>(err) }).boxed();
        }
        // Subscribe before the scan starts so no early result is missed.
        let rx = self.ctx.bus.discovered.subscribe();
        let lease = self.coordinator.register(self.services.clone(), self.options);
        debug!(services = ?self.services, "Scan subscription started");

        let services = self.services;
        let registry = self.registry;
        match_stream(rx, interrupts, lease, move |msg: &Sequenced<Discovery>| {
            let discovery = &msg.event;
            discovery
                .advertisement
                .advertises_any(&services)
                .then(|| {
                    Ok(ScanResult {
                        session: registry.get_or_create(discovery.device),
                        advertisement: discovery.advertisement.clone(),
                        rssi: discovery.rssi,
                    })
                })
        })
        .boxed()
    }
}

enum ScanStreamState {
    Idle(ScanRequest),
    Running(BoxStream<'static, Result<ScanResult>>),
    Done,
}

/// Stream of scan results.
///
/// Lazy: nothing happens until the first poll. Yields results until the
/// radio leaves the powered-on state or the central session is dropped, then
/// a single error.
pub struct ScanStream {
    state: ScanStreamState,
}

impl ScanStream {
    pub(crate) fn new(
        services: &[Uuid],
        options: ScanOptions,
        ctx: Arc<Context>,
        registry: DeviceRegistry,
        coordinator: Arc<ScanCoordinator>,
    ) -> Self {
        Self {
            state: ScanStreamState::Idle(ScanRequest {
                services: services.to_vec(),
                options,
                ctx,
                registry,
                coordinator,
            }),
        }
    }

    /// Whether the stream has been polled and subscribed.
    pub fn is_started(&self) -> bool {
        !matches!(self.state, ScanStreamState::Idle(_))
    }
}

impl Stream for ScanStream {
    type Item = Result<ScanResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let ScanStreamState::Idle(_) = this.state
            && let ScanStreamState::Idle(request) =
                std::mem::replace(&mut this.state, ScanStreamState::Done)
        {
            this.state = ScanStreamState::Running(request.start());
        }
        match &mut this.state {
            ScanStreamState::Running(inner) => match inner.poll_next_unpin(cx) {
                Poll::Ready(None) => {
                    this.state = ScanStreamState::Done;
                    Poll::Ready(None)
                }
                other => other,
            },
            _ => Poll::Ready(None),
        }
    }
}

impl fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanStream")
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state_with(subscriptions: Vec<(Vec<u128>, bool)>) -> ScanState {
        let mut state = ScanState::default();
        for (i, (services, duplicates)) in subscriptions.into_iter().enumerate() {
            state.active.insert(
                i as u64,
                (
                    services.into_iter().map(Uuid::from_u128).collect(),
                    ScanOptions::new().allow_duplicates(duplicates),
                ),
            );
        }
        state
    }

    #[test]
    fn test_no_subscriptions_means_no_scan() {
        assert_eq!(ScanState::default().desired(), None);
    }

    #[test]
    fn test_filters_are_unioned() {
        let desired = state_with(vec![(vec![2, 1], false), (vec![3, 1], true)]).desired().unwrap();
        assert_eq!(
            desired.services,
            vec![Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)]
        );
        assert!(desired.options.allow_duplicates);
    }

    proptest! {
        #[test]
        fn prop_hardware_scan_covers_every_subscription(
            subscriptions in proptest::collection::vec(
                (proptest::collection::vec(0u128..8, 0..4), any::<bool>()),
                1..6,
            )
        ) {
            let desired = state_with(subscriptions.clone()).desired().unwrap();
            let unfiltered = subscriptions.iter().any(|(services, _)| services.is_empty());
            prop_assert_eq!(desired.services.is_empty(), unfiltered);
            for (services, duplicates) in &subscriptions {
                for service in services {
                    prop_assert!(unfiltered || desired.services.contains(&Uuid::from_u128(*service)));
                }
                prop_assert!(!duplicates || desired.options.allow_duplicates);
            }
        }
    }

    #[test]
    fn test_one_unfiltered_subscription_disables_filter() {
        let desired = state_with(vec![(vec![1], false), (vec![], false)]).desired().unwrap();
        assert!(desired.services.is_empty());
        assert!(!desired.options.allow_duplicates);
    }
}
