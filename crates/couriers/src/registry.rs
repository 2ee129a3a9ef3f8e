use crate::connection::Connection;
use crate::error::RelayError;
use courier_common::Identity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Distinguishes successive connections that share an identity.
pub type ConnId = u64;

/// Handle held in the registry, used to write to a live connection.
#[derive(Clone)]
pub struct ConnHandle {
    /// Registry-issued id of this connection.
    pub id: ConnId,
    /// Verified identity that owns the connection.
    pub identity: Identity,
    /// Serialized writer for the connection.
    pub conn: Arc<dyn Connection>,
    /// When the connection was admitted.
    pub connected_at: Instant,
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct Routes {
    by_identity: HashMap<Identity, ConnHandle>,
    closed: bool,
}

/// Concurrent identity → connection table.
///
/// Every mutation is a single write-locked critical section; lookups share
/// the read lock. The lock is never held across an await.
#[derive(Default)]
pub struct Registry {
    routes: RwLock<Routes>,
    next_id: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a handle for a freshly verified connection.
    #[must_use]
    pub fn handle(&self, identity: Identity, conn: Arc<dyn Connection>) -> ConnHandle {
        ConnHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            identity,
            conn,
            connected_at: Instant::now(),
        }
    }

    /// Insert a handle, returning the handle it displaced for the same
    /// identity. The displaced connection is left open.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ShuttingDown`] once [`Registry::close_all`] has run.
    pub fn register(&self, handle: ConnHandle) -> Result<Option<ConnHandle>, RelayError> {
        let mut routes = self.routes.write();
        if routes.closed {
            return Err(RelayError::ShuttingDown);
        }
        Ok(routes.by_identity.insert(handle.identity.clone(), handle))
    }

    /// Current handle for `identity`, if connected.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<ConnHandle> {
        self.routes.read().by_identity.get(identity).cloned()
    }

    /// Remove the entry for `identity`. Removing an absent identity is a no-op.
    pub fn deregister(&self, identity: &str) -> Option<ConnHandle> {
        self.routes.write().by_identity.remove(identity)
    }

    /// Remove the entry for `identity` only if it still belongs to `id`.
    /// Returns `true` if an entry was removed.
    pub fn deregister_if(&self, identity: &str, id: ConnId) -> bool {
        let mut routes = self.routes.write();
        match routes.by_identity.get(identity) {
            Some(current) if current.id == id => {
                routes.by_identity.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Empty the table, refuse further registrations, and close every
    /// connection that was registered. Returns the number closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<ConnHandle> = {
            let mut routes = self.routes.write();
            routes.closed = true;
            routes.by_identity.drain().map(|(_, handle)| handle).collect()
        };
        let count = drained.len();
        futures_util::future::join_all(drained.iter().map(|handle| handle.conn.close())).await;
        count
    }

    /// Returns `true` once [`Registry::close_all`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.routes.read().closed
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().by_identity.len()
    }

    /// Returns `true` if no identity is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().by_identity.is_empty()
    }
}
