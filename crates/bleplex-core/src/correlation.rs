//! Matching unlabelled bus events to the operation waiting for them.
//!
//! An operation subscribes to the channel of the callback kind it waits for
//! before issuing its command, then takes the first message accepted by its
//! matcher. While waiting it also watches for conditions that make the
//! completion impossible: the central session going away, the radio leaving
//! the powered-on state and, for operations that need a link, the device
//! disconnecting.

use futures::Stream;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use bleplex_types::RadioState;

use crate::error::{Error, Result};
use crate::events::Sequenced;
use crate::radio::RadioLoss;

/// Conditions that abort a pending operation, checked in priority order.
///
/// The radio condition is latched: a loss counted after construction fails
/// the operation even if the radio has powered on again since.
#[derive(Debug, Clone)]
pub(crate) struct Interrupts {
    shutdown: CancellationToken,
    losses: watch::Receiver<RadioLoss>,
    baseline: u64,
    unavailable: Option<RadioState>,
    link: Option<watch::Receiver<bool>>,
}

impl Interrupts {
    pub fn new(
        shutdown: CancellationToken,
        radio: watch::Receiver<RadioState>,
        mut losses: watch::Receiver<RadioLoss>,
        link: Option<watch::Receiver<bool>>,
    ) -> Self {
        // Read the count before the state so a loss in between is not missed.
        let baseline = losses.borrow_and_update().count;
        let current = *radio.borrow();
        Self {
            shutdown,
            losses,
            baseline,
            unavailable: (!current.is_powered_on()).then_some(current),
            link,
        }
    }

    /// Current interruption, if any.
    pub fn check(&mut self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Deallocated);
        }
        if let Some(state) = self.unavailable {
            return Err(Error::RadioUnavailable(state));
        }
        let loss = *self.losses.borrow_and_update();
        if loss.count != self.baseline {
            self.unavailable = Some(loss.state);
            return Err(Error::RadioUnavailable(loss.state));
        }
        if let Some(link) = self.link.as_mut()
            && !*link.borrow_and_update()
        {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Resolves with the first interruption. Pending forever otherwise.
    pub async fn interrupted(&mut self) -> Error {
        loop {
            if let Err(err) = self.check() {
                return err;
            }
            let changed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Error::Deallocated,
                changed = self.losses.changed() => changed,
                changed = link_changed(&mut self.link) => changed,
            };
            if changed.is_err() {
                return Error::Deallocated;
            }
        }
    }
}

async fn link_changed(
    link: &mut Option<watch::Receiver<bool>>,
) -> std::result::Result<(), watch::error::RecvError> {
    match link {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

/// Wait for the first message accepted by `matcher`.
///
/// The matcher returns `None` to skip a message and `Some` to complete with
/// its result. Interruptions take priority over a message that is ready at the
/// same time.
pub(crate) async fn next_match<E, T, F>(
    rx: &mut broadcast::Receiver<Sequenced<E>>,
    interrupts: &mut Interrupts,
    matcher: &mut F,
) -> Result<T>
where
    E: Clone,
    F: FnMut(&Sequenced<E>) -> Option<Result<T>>,
{
    loop {
        tokio::select! {
            biased;
            err = interrupts.interrupted() => return Err(err),
            msg = rx.recv() => match msg {
                Ok(msg) => {
                    if let Some(result) = matcher(&msg) {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Deallocated),
            },
        }
    }
}

/// Stream every message accepted by `matcher`.
///
/// The first error, from the matcher or an interruption, is yielded and ends
/// the stream. `guard` lives as long as the stream.
pub(crate) fn match_stream<E, T, F, G>(
    rx: broadcast::Receiver<Sequenced<E>>,
    interrupts: Interrupts,
    guard: G,
    matcher: F,
) -> impl Stream<Item = Result<T>> + Send + 'static
where
    E: Clone + Send + 'static,
    T: Send + 'static,
    F: FnMut(&Sequenced<E>) -> Option<Result<T>> + Send + 'static,
    G: Send + 'static,
{
    futures::stream::unfold(
        Some((rx, interrupts, matcher, guard)),
        |state| async move {
            let (mut rx, mut interrupts, mut matcher, guard) = state?;
            match next_match(&mut rx, &mut interrupts, &mut matcher).await {
                Ok(item) => Some((Ok(item), Some((rx, interrupts, matcher, guard)))),
                Err(err) => Some((Err(err), None)),
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioCell;
    use futures::StreamExt;

    struct Fixture {
        shutdown: CancellationToken,
        radio: RadioCell,
        link: watch::Sender<bool>,
        bus: broadcast::Sender<Sequenced<u32>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                shutdown: CancellationToken::new(),
                radio: powered_on(),
                link: watch::Sender::new(true),
                bus: broadcast::channel(16).0,
            }
        }

        fn interrupts(&self, with_link: bool) -> Interrupts {
            Interrupts::new(
                self.shutdown.clone(),
                self.radio.subscribe(),
                self.radio.subscribe_losses(),
                with_link.then(|| self.link.subscribe()),
            )
        }

        fn send(&self, seq: u64, event: u32) {
            self.bus.send(Sequenced { seq, event }).unwrap();
        }
    }

    fn powered_on() -> RadioCell {
        let cell = RadioCell::new();
        cell.apply(RadioState::PoweredOn);
        cell
    }

    fn even(msg: &Sequenced<u32>) -> Option<Result<u32>> {
        (msg.event % 2 == 0).then_some(Ok(msg.event))
    }

    #[tokio::test]
    async fn test_next_match_skips_unmatched() {
        let fx = Fixture::new();
        let mut rx = fx.bus.subscribe();
        let mut interrupts = fx.interrupts(true);
        fx.send(1, 1);
        fx.send(2, 3);
        fx.send(3, 4);
        let result = next_match(&mut rx, &mut interrupts, &mut even).await;
        assert_eq!(result, Ok(4));
    }

    #[tokio::test]
    async fn test_radio_loss_wins_over_ready_message() {
        let fx = Fixture::new();
        let mut rx = fx.bus.subscribe();
        let mut interrupts = fx.interrupts(true);
        fx.send(1, 2);
        fx.radio.apply(RadioState::PoweredOff);
        fx.link.send_replace(false);
        let result = next_match(&mut rx, &mut interrupts, &mut even).await;
        assert_eq!(result, Err(Error::RadioUnavailable(RadioState::PoweredOff)));
    }

    #[tokio::test]
    async fn test_power_cycle_before_poll_still_interrupts() {
        let fx = Fixture::new();
        let mut rx = fx.bus.subscribe();
        let mut interrupts = fx.interrupts(true);
        fx.radio.apply(RadioState::PoweredOff);
        fx.radio.apply(RadioState::PoweredOn);
        fx.send(1, 2);
        assert_eq!(
            next_match(&mut rx, &mut interrupts, &mut even).await,
            Err(Error::RadioUnavailable(RadioState::PoweredOff))
        );
        // Latched: later checks keep reporting the loss.
        assert_eq!(
            interrupts.check(),
            Err(Error::RadioUnavailable(RadioState::PoweredOff))
        );
    }

    #[tokio::test]
    async fn test_interrupts_created_while_off_fail_immediately() {
        let fx = Fixture::new();
        fx.radio.apply(RadioState::Resetting);
        let mut interrupts = fx.interrupts(false);
        fx.radio.apply(RadioState::PoweredOn);
        assert_eq!(
            interrupts.check(),
            Err(Error::RadioUnavailable(RadioState::Resetting))
        );
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_only_link_bound_waiters() {
        let fx = Fixture::new();
        let mut rx = fx.bus.subscribe();
        let mut bound = fx.interrupts(true);
        let mut unbound = fx.interrupts(false);
        fx.link.send_replace(false);
        fx.send(1, 6);
        assert_eq!(
            next_match(&mut rx, &mut bound, &mut even).await,
            Err(Error::NotConnected)
        );
        assert_eq!(next_match(&mut rx, &mut unbound, &mut even).await, Ok(6));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_wait() {
        let fx = Fixture::new();
        let mut rx = fx.bus.subscribe();
        let mut interrupts = fx.interrupts(false);
        let token = fx.shutdown.clone();
        let waiter =
            tokio::spawn(async move { next_match(&mut rx, &mut interrupts, &mut even).await });
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Error::Deallocated));
    }

    #[tokio::test]
    async fn test_match_stream_ends_after_error() {
        let fx = Fixture::new();
        let stream = match_stream(fx.bus.subscribe(), fx.interrupts(true), (), even);
        fx.send(1, 2);
        fx.send(2, 4);
        fx.link.send_replace(false);
        let items: Vec<_> = stream.collect().await;
        // Interruption is checked before each receive, so buffered messages
        // queued before the disconnect are not delivered.
        assert_eq!(items, vec![Err(Error::NotConnected)]);
    }

    #[tokio::test]
    async fn test_match_stream_yields_in_order() {
        let fx = Fixture::new();
        let mut stream = Box::pin(match_stream(fx.bus.subscribe(), fx.interrupts(false), (), even));
        fx.send(1, 2);
        fx.send(2, 3);
        fx.send(3, 8);
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, Some(Ok(8)));
    }
}
