//! Ephemeral typing indicators. Nothing is stored and nothing is retried;
//! an absent receiver or failed push is a silent no-op.

use crate::messages::ServerMessage;
use crate::presence::PresenceRegistry;

#[derive(Clone)]
pub struct TypingRelay {
    presence: PresenceRegistry,
}

impl TypingRelay {
    pub fn new(presence: PresenceRegistry) -> Self {
        TypingRelay { presence }
    }

    pub async fn notify_typing(&self, sender: &str, receiver: &str) {
        self.forward(
            receiver,
            ServerMessage::UserTyping {
                sender: sender.to_string(),
            },
        )
        .await;
    }

    pub async fn notify_stop_typing(&self, sender: &str, receiver: &str) {
        self.forward(
            receiver,
            ServerMessage::UserStopTyping {
                sender: sender.to_string(),
            },
        )
        .await;
    }

    async fn forward(&self, receiver: &str, signal: ServerMessage) {
        if let Some(route) = self.presence.route(receiver).await {
            let _ = route.push(&signal);
        }
    }
}
