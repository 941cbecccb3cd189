//! In-memory mapping between participant identity and active connection.
//!
//! One live entry per identity; re-registration replaces the previous entry
//! (newest wins). Removal is guarded by connection id so a superseded
//! session's late close cannot evict the newer one.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use warp::ws::Message;

use crate::messages::ServerMessage;

#[derive(Debug, Error)]
#[error("connection closed")]
pub struct PushError;

/// Handle to one live connection: the writer-task channel plus a delivery
/// lock serializing backlog flushes and live sends for the owning identity.
/// The lock is keyed by identity and survives re-registration, so a flush
/// still running for a superseded session cannot interleave with deliveries
/// to the replacement.
#[derive(Clone)]
pub struct Route {
    conn_id: String,
    tx: mpsc::UnboundedSender<Message>,
    delivery_lock: Arc<Mutex<()>>,
}

impl Route {
    pub fn new(conn_id: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Route {
            conn_id,
            tx,
            delivery_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Queues a message on the connection's writer task. Fails only when the
    /// writer task is gone, which callers treat as the receiver being absent.
    pub fn push(&self, message: &ServerMessage) -> Result<(), PushError> {
        let text = serde_json::to_string(message).map_err(|_| PushError)?;
        self.tx.send(Message::text(text)).map_err(|_| PushError)
    }

    pub async fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery_lock.lock().await
    }
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<HashMap<String, Route>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the route for `identity` and returns the
    /// installed route together with the identity's delivery lock, already
    /// held. The lock is acquired before the entry becomes visible to
    /// `route` lookups, so a live send that observes the new registration
    /// cannot deliver ahead of the registration's backlog flush; the caller
    /// hands the guard to the flush. An existing entry's lock is carried
    /// over to the replacement, which also makes registration wait out any
    /// delivery still running for a superseded session.
    pub async fn register(&self, identity: &str, route: Route) -> (Route, OwnedMutexGuard<()>) {
        loop {
            let lock = self
                .inner
                .read()
                .await
                .get(identity)
                .map_or_else(|| route.delivery_lock.clone(), |r| r.delivery_lock.clone());

            let guard = lock.clone().lock_owned().await;

            let mut entries = self.inner.write().await;
            // A concurrent registration may have installed a different lock
            // while this one was waiting; start over on the current one.
            if let Some(current) = entries.get(identity) {
                if !Arc::ptr_eq(&current.delivery_lock, &lock) {
                    continue;
                }
            }
            let route = Route {
                delivery_lock: lock,
                ..route.clone()
            };
            entries.insert(identity.to_string(), route.clone());
            return (route, guard);
        }
    }

    /// Removes the entry for `identity` only if it is still owned by
    /// `conn_id`. Returns whether a removal occurred; a stale connection's
    /// close must not evict a newer session.
    pub async fn unregister(&self, identity: &str, conn_id: &str) -> bool {
        let mut entries = self.inner.write().await;
        match entries.get(identity) {
            Some(route) if route.conn_id == conn_id => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub async fn route(&self, identity: &str) -> Option<Route> {
        self.inner.read().await.get(identity).cloned()
    }

    /// Sorted snapshot of online identities, minus `exclude`.
    pub async fn list(&self, exclude: Option<&str>) -> Vec<String> {
        let entries = self.inner.read().await;
        let mut identities: Vec<String> = entries
            .keys()
            .filter(|identity| Some(identity.as_str()) != exclude)
            .cloned()
            .collect();
        identities.sort();
        identities
    }

    /// Snapshot of all entries, for presence broadcasts.
    pub async fn routes(&self) -> Vec<(String, Route)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(identity, route)| (identity.clone(), route.clone()))
            .collect()
    }
}
