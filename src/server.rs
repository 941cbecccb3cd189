//! Connection lifecycle: bind an identity to a WebSocket, broadcast
//! presence, replay the backlog, and clean up on disconnect.
//!
//! Each connection moves through Unbound -> Bound(identity) -> Closed. A
//! connection binds at most once; changing identity requires a new
//! connection.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::delivery::OfflineDelivery;
use crate::messages::{ClientMessage, ServerMessage};
use crate::presence::{PresenceRegistry, Route};
use crate::relay::TypingRelay;
use crate::router::MessageRouter;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct ChatServer {
    presence: PresenceRegistry,
    store: Arc<dyn MessageStore>,
    router: MessageRouter,
    relay: TypingRelay,
    delivery: OfflineDelivery,
}

impl ChatServer {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        let presence = PresenceRegistry::new();
        ChatServer {
            router: MessageRouter::new(store.clone(), presence.clone()),
            relay: TypingRelay::new(presence.clone()),
            delivery: OfflineDelivery::new(store.clone()),
            presence,
            store,
        }
    }

    /// Store handle for the read-only history endpoint.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let conn_id = Uuid::new_v4().to_string();
        info!("new connection {}", conn_id);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer_conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    debug!("writer for {} stopped: {}", writer_conn_id, e);
                    break;
                }
            }
        });

        let mut bound: Option<String> = None;

        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("socket error on {}: {}", conn_id, e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(text) {
                Ok(client_msg) => {
                    self.handle_client_message(client_msg, &conn_id, &tx, &mut bound)
                        .await;
                }
                Err(e) => warn!("unparseable frame from {}: {}", conn_id, e),
            }
        }

        self.handle_disconnect(&conn_id, bound).await;
    }

    async fn handle_client_message(
        &self,
        message: ClientMessage,
        conn_id: &str,
        tx: &mpsc::UnboundedSender<Message>,
        bound: &mut Option<String>,
    ) {
        match message {
            ClientMessage::RegisterUser { username } => {
                if bound.is_some() {
                    warn!(
                        "connection {} is already bound, ignoring register_user",
                        conn_id
                    );
                    return;
                }
                let identity = username.trim().to_string();
                if identity.is_empty() {
                    push_to(
                        tx,
                        &ServerMessage::Error {
                            message: "username must not be empty".to_string(),
                        },
                    );
                    return;
                }

                // The registry hands back the installed route plus the
                // identity's delivery lock, held since before the route
                // became visible. The flush takes the guard, so a live send
                // racing this registration waits behind the backlog.
                let (route, guard) = self
                    .presence
                    .register(&identity, Route::new(conn_id.to_string(), tx.clone()))
                    .await;
                info!("registered {} on connection {}", identity, conn_id);
                *bound = Some(identity.clone());

                self.broadcast_online_users().await;

                if let Err(e) = self.delivery.flush(&identity, &route, guard).await {
                    error!("backlog flush for {} failed: {}", identity, e);
                    push_to(
                        tx,
                        &ServerMessage::Error {
                            message: "failed to load queued messages".to_string(),
                        },
                    );
                }
            }

            ClientMessage::SendMessage {
                sender,
                receiver,
                text,
            } => match self.router.send(&sender, &receiver, &text).await {
                Ok(message) => {
                    push_to(
                        tx,
                        &ServerMessage::MessageSent {
                            receiver,
                            text,
                            timestamp: message.timestamp,
                        },
                    );
                }
                Err(e) => {
                    warn!("send from {} on {} rejected: {}", sender, conn_id, e);
                    push_to(
                        tx,
                        &ServerMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            },

            ClientMessage::Typing { sender, receiver } => {
                self.relay.notify_typing(&sender, &receiver).await;
            }

            ClientMessage::StopTyping { sender, receiver } => {
                self.relay.notify_stop_typing(&sender, &receiver).await;
            }
        }
    }

    async fn handle_disconnect(&self, conn_id: &str, bound: Option<String>) {
        let Some(identity) = bound else {
            info!("connection {} closed before registering", conn_id);
            return;
        };

        if self.presence.unregister(&identity, conn_id).await {
            info!("{} disconnected", identity);
            self.broadcast_online_users().await;
        } else {
            // The identity re-registered on a newer connection; the online
            // set did not change, so nothing is broadcast.
            debug!(
                "stale connection {} for {} closed, session already superseded",
                conn_id, identity
            );
        }
    }

    /// Pushes the online-identity list to every bound connection, each list
    /// excluding the recipient itself. All lists derive from one snapshot,
    /// so every recipient sees the same broadcast set.
    async fn broadcast_online_users(&self) {
        let entries = self.presence.routes().await;
        let mut identities: Vec<String> = entries
            .iter()
            .map(|(identity, _)| identity.clone())
            .collect();
        identities.sort();

        for (identity, route) in &entries {
            let users: Vec<String> = identities
                .iter()
                .filter(|other| other.as_str() != identity.as_str())
                .cloned()
                .collect();
            let _ = route.push(&ServerMessage::OnlineUsers { users });
        }
    }
}

fn push_to(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = tx.send(Message::text(text));
    }
}
