//! Direct-message WebSocket server with durable offline delivery.
//!
//! ## Modules
//!
//! - [`messages`] – wire protocol (tagged JSON client/server messages)
//! - [`error`] – send-path error taxonomy
//! - [`store`] – durable message store (SQLite via sqlx)
//! - [`presence`] – identity -> connection registry
//! - [`router`] – persist-then-deliver send orchestration
//! - [`relay`] – ephemeral typing indicators
//! - [`delivery`] – backlog replay on reconnection
//! - [`server`] – connection lifecycle and WebSocket plumbing

pub mod delivery;
pub mod error;
pub mod messages;
pub mod presence;
pub mod relay;
pub mod router;
pub mod server;
pub mod store;

pub use error::ChatError;
pub use server::ChatServer;
pub use store::{MessageStore, SqliteStore, StoreError, StoredMessage};
