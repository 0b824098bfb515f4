//! Radio power state tracking.
//!
//! The dispatch task is the only writer; every handle reads the latest value
//! from a `watch` channel, so observers always start with the current state.
//!
//! Losses are also counted on a second channel. A waiter compares the count
//! against the one it saw when it started, so a power cycle that completes
//! before the waiter is polled is still reported as a loss.

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::info;

use bleplex_types::RadioState;

use crate::error::{Error, Result};

/// Read-only view of the radio state.
///
/// Obtained from [`CentralSession::radio`](crate::CentralSession::radio).
#[derive(Debug, Clone)]
pub struct RadioStateTracker {
    rx: watch::Receiver<RadioState>,
}

impl RadioStateTracker {
    pub(crate) fn new(rx: watch::Receiver<RadioState>) -> Self {
        Self { rx }
    }

    /// The latest reported state.
    pub fn current(&self) -> RadioState {
        *self.rx.borrow()
    }

    /// Stream of states: the current one first, then every change.
    ///
    /// Ends only when the central session is dropped.
    pub fn observe(&self) -> WatchStream<RadioState> {
        WatchStream::new(self.rx.clone())
    }

    /// Wait until the radio reports `state`.
    ///
    /// Resolves immediately if it already does.
    pub async fn wait_for(&self, state: RadioState) -> Result<()> {
        let mut rx = self.rx.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::Deallocated)
    }

    /// Fail with [`Error::RadioUnavailable`] unless powered on.
    pub fn ensure_powered_on(&self) -> Result<()> {
        let state = self.current();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(Error::RadioUnavailable(state))
        }
    }
}

/// Every transition away from powered on, counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RadioLoss {
    /// Number of losses so far.
    pub count: u64,
    /// The state the radio entered on the latest loss.
    pub state: RadioState,
}

/// Writing half, owned by the shared session state.
#[derive(Debug)]
pub(crate) struct RadioCell {
    tx: watch::Sender<RadioState>,
    losses: watch::Sender<RadioLoss>,
}

impl RadioCell {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(RadioState::Unknown),
            losses: watch::Sender::new(RadioLoss {
                count: 0,
                state: RadioState::Unknown,
            }),
        }
    }

    pub fn tracker(&self) -> RadioStateTracker {
        RadioStateTracker::new(self.tx.subscribe())
    }

    pub fn subscribe(&self) -> watch::Receiver<RadioState> {
        self.tx.subscribe()
    }

    pub fn subscribe_losses(&self) -> watch::Receiver<RadioLoss> {
        self.losses.subscribe()
    }

    pub fn current(&self) -> RadioState {
        *self.tx.borrow()
    }

    /// Record a new state. Returns `true` when sessions must be reset, i.e.
    /// whenever the new state is anything but powered on.
    pub fn apply(&self, state: RadioState) -> bool {
        let previous = self.tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Radio state changed");
        }
        if state.is_powered_on() {
            return false;
        }
        self.losses.send_modify(|loss| {
            loss.count += 1;
            loss.state = state;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_observe_replays_current_value() {
        let cell = RadioCell::new();
        cell.apply(RadioState::PoweredOn);

        let tracker = cell.tracker();
        let mut stream = tracker.observe();
        assert_eq!(stream.next().await, Some(RadioState::PoweredOn));

        cell.apply(RadioState::PoweredOff);
        assert_eq!(stream.next().await, Some(RadioState::PoweredOff));
    }

    #[test]
    fn test_apply_reports_loss() {
        let cell = RadioCell::new();
        assert!(!cell.apply(RadioState::PoweredOn));
        assert!(cell.apply(RadioState::Resetting));
        assert!(cell.apply(RadioState::Unauthorized));
        assert_eq!(cell.current(), RadioState::Unauthorized);
    }

    #[test]
    fn test_power_cycle_is_counted_as_loss() {
        let cell = RadioCell::new();
        cell.apply(RadioState::PoweredOn);
        let losses = cell.subscribe_losses();
        let before = losses.borrow().count;

        cell.apply(RadioState::PoweredOff);
        cell.apply(RadioState::PoweredOn);

        assert_eq!(cell.current(), RadioState::PoweredOn);
        let loss = *losses.borrow();
        assert_eq!(loss.count, before + 1);
        assert_eq!(loss.state, RadioState::PoweredOff);
    }

    #[test]
    fn test_ensure_powered_on() {
        let cell = RadioCell::new();
        let tracker = cell.tracker();
        assert_eq!(
            tracker.ensure_powered_on(),
            Err(Error::RadioUnavailable(RadioState::Unknown))
        );
        cell.apply(RadioState::PoweredOn);
        assert_eq!(tracker.ensure_powered_on(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_for() {
        let cell = RadioCell::new();
        let tracker = cell.tracker();
        let waiter = tokio::spawn(async move { tracker.wait_for(RadioState::PoweredOn).await });
        tokio::task::yield_now().await;
        cell.apply(RadioState::PoweredOff);
        cell.apply(RadioState::PoweredOn);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_for_fails_when_dropped() {
        let cell = RadioCell::new();
        let tracker = cell.tracker();
        drop(cell);
        assert_eq!(
            tracker.wait_for(RadioState::PoweredOn).await,
            Err(Error::Deallocated)
        );
    }
}
