//! Backlog replay on reconnection.

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::messages::ServerMessage;
use crate::presence::Route;
use crate::store::{MessageStore, StoreError};

#[derive(Clone)]
pub struct OfflineDelivery {
    store: Arc<dyn MessageStore>,
}

impl OfflineDelivery {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        OfflineDelivery { store }
    }

    /// Drains the undelivered backlog for `identity` into `route`, oldest
    /// first, marking each message delivered only after it was pushed.
    /// `guard` is the identity's delivery lock, acquired by registration
    /// before the route became visible: no live send can deliver ahead of
    /// the backlog, and flushes are strictly sequential per identity.
    ///
    /// A push failure stops the flush; whatever remains stays queued for the
    /// next registration. Returns the number of messages delivered.
    pub async fn flush(
        &self,
        identity: &str,
        route: &Route,
        guard: OwnedMutexGuard<()>,
    ) -> Result<usize, StoreError> {
        let _guard = guard;

        let pending = self.store.pending_for(identity).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let total = pending.len();
        let mut delivered = 0;
        for message in pending {
            let payload = ServerMessage::ReceiveMessage {
                sender: message.sender.clone(),
                text: message.text.clone(),
                timestamp: message.timestamp,
            };
            if route.push(&payload).is_err() {
                warn!(
                    "connection for {} dropped mid-flush, {} of {} left queued",
                    identity,
                    total - delivered,
                    total
                );
                break;
            }
            self.store.mark_delivered(&message.id).await?;
            delivered += 1;
        }

        if delivered > 0 {
            info!("delivered {} queued messages to {}", delivered, identity);
        }
        Ok(delivered)
    }
}
