//! State shared by the central session, every device session and the
//! dispatch task.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::correlation::Interrupts;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::radio::RadioCell;
use crate::transport::Transport;

/// Holds no reference to any device session.
pub(crate) struct Context {
    pub transport: Arc<dyn Transport>,
    pub bus: EventBus,
    pub radio: RadioCell,
    pub shutdown: CancellationToken,
    pub config: SessionConfig,
}

impl Context {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            bus: EventBus::new(config.event_capacity),
            radio: RadioCell::new(),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Fail fast unless the session is alive and the radio is powered on.
    pub fn ensure_powered_on(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Deallocated);
        }
        let state = self.radio.current();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(Error::RadioUnavailable(state))
        }
    }

    pub fn interrupts(&self, link: Option<watch::Receiver<bool>>) -> Interrupts {
        Interrupts::new(
            self.shutdown.clone(),
            self.radio.subscribe(),
            self.radio.subscribe_losses(),
            link,
        )
    }

    /// Apply the configured per-caller operation timeout.
    pub async fn with_operation_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.config.operation_timeout() {
            Some(duration) => tokio::time::timeout(duration, fut)
                .await
                .map_err(|_| Error::timeout(operation, duration))?,
            None => fut.await,
        }
    }
}
