//! Peripheral-role advertising.
//!
//! Only one advertisement can be active. The [`Advertisement`] guard returned
//! by [`CentralSession::advertise`](crate::CentralSession::advertise) stops
//! advertising when dropped, and so does dropping the pending `advertise` call
//! before the platform confirmed the start.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::correlation::next_match;
use crate::error::{Error, NativeError, Result};
use crate::events::Sequenced;
use crate::options::AdvertisingData;

#[derive(Debug, Default)]
struct SlotState {
    next_id: u64,
    active: Option<u64>,
}

/// The single advertising slot of a central session.
pub(crate) struct AdvertisingSlot {
    ctx: Arc<Context>,
    state: Mutex<SlotState>,
}

impl AdvertisingSlot {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            state: Mutex::new(SlotState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .expect("advertising lock poisoned - a thread panicked while holding the lock")
    }

    pub async fn advertise(self: &Arc<Self>, data: AdvertisingData) -> Result<Advertisement> {
        let (mut rx, mut interrupts, mut guard) = {
            let mut state = self.state();
            self.ctx.ensure_powered_on()?;
            if state.active.is_some() {
                return Err(Error::AdvertisingInProgress);
            }
            state.next_id += 1;
            let id = state.next_id;
            state.active = Some(id);

            let rx = self.ctx.bus.advertising.subscribe();
            let interrupts = self.ctx.interrupts(None);
            info!(local_name = ?data.local_name, "Starting advertising");
            self.ctx.transport.start_advertising(&data);
            let guard = Advertisement {
                slot: Arc::clone(self),
                id,
                data,
                armed: true,
            };
            (rx, interrupts, guard)
        };

        let mut matcher =
            |msg: &Sequenced<std::result::Result<(), NativeError>>| Some(Ok(msg.event.clone()));
        match next_match(&mut rx, &mut interrupts, &mut matcher).await? {
            Ok(()) => {
                debug!("Advertising started");
                Ok(guard)
            }
            Err(native) => {
                warn!(error = %native, "Advertising failed to start");
                guard.armed = false;
                Err(Error::AdvertisingStartFailed(native))
            }
        }
    }

    /// The platform stopped advertising on its own (radio loss).
    pub fn reset(&self) {
        self.state().active = None;
    }

    pub fn is_active(&self) -> bool {
        self.state().active.is_some()
    }
}

/// An active advertisement. Dropping it stops advertising.
#[derive(Debug)]
pub struct Advertisement {
    slot: Arc<AdvertisingSlot>,
    id: u64,
    data: AdvertisingData,
    armed: bool,
}

impl Advertisement {
    /// The advertised payload.
    pub fn data(&self) -> &AdvertisingData {
        &self.data
    }

    /// Stop advertising now.
    pub fn stop(self) {}
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        let mut state = self.slot.state();
        if state.active != Some(self.id) {
            return;
        }
        state.active = None;
        if self.armed && self.slot.ctx.ensure_powered_on().is_ok() {
            info!("Stopping advertising");
            self.slot.ctx.transport.stop_advertising();
        }
    }
}

impl std::fmt::Debug for AdvertisingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertisingSlot")
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}
