//! Device identity registry.
//!
//! Maps each [`DeviceId`] to its single [`DeviceSession`]. Scan results,
//! connection events, state restoration and explicit lookups can all ask for
//! the same never-seen identity at once; the check-and-insert runs under the
//! write lock so exactly one session is ever published per identity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use bleplex_types::DeviceId;

use crate::context::Context;
use crate::session::DeviceSession;

/// Registry of live device sessions, owned by the central session.
#[derive(Clone)]
pub struct DeviceRegistry {
    ctx: Arc<Context>,
    sessions: Arc<RwLock<HashMap<DeviceId, DeviceSession>>>,
}

impl DeviceRegistry {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The session for `id`, creating it on first access.
    ///
    /// Repeated and concurrent calls return the same instance. Creating a
    /// session issues no transport command.
    pub fn get_or_create(&self, id: DeviceId) -> DeviceSession {
        if let Some(session) = self.get(id) {
            return session;
        }

        let mut sessions = self
            .sessions
            .write()
            .expect("registry lock poisoned - a thread panicked while holding the lock");
        sessions
            .entry(id)
            .or_insert_with(|| {
                debug!(device = %id, "Creating device session");
                DeviceSession::new(id, Arc::clone(&self.ctx))
            })
            .clone()
    }

    /// The session for `id`, if one exists.
    pub fn get(&self, id: DeviceId) -> Option<DeviceSession> {
        self.sessions
            .read()
            .expect("registry lock poisoned - a thread panicked while holding the lock")
            .get(&id)
            .cloned()
    }

    /// Forget the session for `id`.
    ///
    /// Existing handles stay usable, but the next lookup creates a new session
    /// and the evicted one no longer receives events.
    pub fn evict(&self, id: DeviceId) -> Option<DeviceSession> {
        let evicted = self
            .sessions
            .write()
            .expect("registry lock poisoned - a thread panicked while holding the lock")
            .remove(&id);
        if evicted.is_some() {
            debug!(device = %id, "Evicted device session");
        }
        evicted
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("registry lock poisoned - a thread panicked while holding the lock")
            .len()
    }

    /// Whether no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every tracked session.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions
            .read()
            .expect("registry lock poisoned - a thread panicked while holding the lock")
            .values()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::mock::MockTransport;
    use uuid::Uuid;

    fn registry() -> DeviceRegistry {
        let (transport, _events) = MockTransport::new();
        DeviceRegistry::new(Arc::new(Context::new(transport, SessionConfig::default())))
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = registry();
        let id = DeviceId::new(Uuid::from_u128(7));
        let first = registry.get_or_create(id);
        let second = registry.get_or_create(id);
        assert!(first.ptr_eq(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_session() {
        let registry = registry();
        let id = DeviceId::new(Uuid::from_u128(42));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create(id))
            })
            .collect();
        let sessions: Vec<DeviceSession> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sessions.iter().all(|s| s.ptr_eq(&sessions[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_evict_then_recreate() {
        let registry = registry();
        let id = DeviceId::new(Uuid::from_u128(9));
        let original = registry.get_or_create(id);
        let evicted = registry.evict(id).unwrap();
        assert!(evicted.ptr_eq(&original));
        assert!(registry.is_empty());
        assert!(registry.get(id).is_none());

        let fresh = registry.get_or_create(id);
        assert!(!fresh.ptr_eq(&original));
        assert_eq!(registry.sessions().len(), 1);
    }
}
