//! Send orchestration: persist first, then attempt live delivery.

use log::{debug, warn};
use std::sync::Arc;

use crate::error::ChatError;
use crate::messages::ServerMessage;
use crate::presence::{PresenceRegistry, Route};
use crate::store::{MessageStore, StoredMessage};

#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn MessageStore>,
    presence: PresenceRegistry,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn MessageStore>, presence: PresenceRegistry) -> Self {
        MessageRouter { store, presence }
    }

    /// Persists the message and pushes it to the receiver if they are
    /// online. Returns the persisted record for the sender's ack regardless
    /// of whether live delivery happened; an offline receiver is the normal
    /// queued case, not an error.
    pub async fn send(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<StoredMessage, ChatError> {
        if sender.trim().is_empty() {
            return Err(ChatError::InvalidMessage("sender"));
        }
        if receiver.trim().is_empty() {
            return Err(ChatError::InvalidMessage("receiver"));
        }
        if text.trim().is_empty() {
            return Err(ChatError::InvalidMessage("text"));
        }

        // Persistence precedes delivery: a message that cannot be stored is
        // never pushed, and a stored message survives a failed push.
        let message = self.store.append(sender, receiver, text).await?;

        if let Some(route) = self.presence.route(receiver).await {
            self.deliver_live(&route, &message).await;
        } else {
            debug!("{} is offline, message {} queued", receiver, message.id);
        }

        Ok(message)
    }

    /// Live delivery under the receiver's delivery lock. A registration
    /// flush running at the same instant may already have picked the message
    /// up from the backlog; the re-check under the lock makes whichever path
    /// wins safe and keeps the wire order equal to the store order.
    async fn deliver_live(&self, route: &Route, message: &StoredMessage) {
        let _guard = route.lock_delivery().await;

        match self.store.is_delivered(&message.id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!("delivery check for {} failed, leaving queued: {}", message.id, e);
                return;
            }
        }

        let payload = ServerMessage::ReceiveMessage {
            sender: message.sender.clone(),
            text: message.text.clone(),
            timestamp: message.timestamp,
        };

        if route.push(&payload).is_err() {
            // Connection torn down between route lookup and push: same as
            // absent, the next registration flush picks the message up.
            debug!(
                "push to {} failed, message {} stays queued",
                message.receiver, message.id
            );
            return;
        }

        if let Err(e) = self.store.mark_delivered(&message.id).await {
            warn!("could not mark {} delivered: {}", message.id, e);
        }
    }
}
