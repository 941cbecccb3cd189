//! Durable message store: append-only records with a delivered flag.
//!
//! Backed by SQLite via sqlx. The `delivered` flag is the single point of
//! truth for delivery: `mark_delivered` is a compare-and-set, so the live
//! send path and a concurrent backlog flush can both attempt the same
//! message and only one transition ever happens.

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted message. `timestamp` is UTC milliseconds assigned at append;
/// within one sender/receiver pair it is non-decreasing, and insertion order
/// (rowid) breaks ties, so backlog replay order is total.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub timestamp: i64,
    pub delivered: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a new message with `delivered = false` and a server-assigned
    /// timestamp. A store failure surfaces here; it is never swallowed,
    /// because losing a send must be visible to the sender.
    async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Atomically sets `delivered = true` if it is not already. Returns
    /// whether this call performed the transition; `false` means another
    /// delivery path already claimed the message.
    async fn mark_delivered(&self, id: &str) -> Result<bool, StoreError>;

    /// Point read of the delivered flag, used to re-check a message under
    /// the receiver's delivery lock before pushing it.
    async fn is_delivered(&self, id: &str) -> Result<bool, StoreError>;

    /// Undelivered messages for `receiver`, oldest first. Defines the replay
    /// order for backlog flushes.
    async fn pending_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// Full conversation between two identities, both directions, ascending.
    /// Consumed only by the history read endpoint.
    async fn between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        info!("opening message store: {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// In-memory store on a single pooled connection. Every pooled SQLite
    /// connection gets its own `:memory:` database, so the pool is pinned
    /// to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::from)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_backlog
                ON messages(receiver, delivered, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender, receiver, timestamp);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<StoredMessage, StoreError> {
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: text.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            delivered: false,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender, receiver, text, timestamp, delivered)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.sender)
        .bind(&message.receiver)
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(message.delivered)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    async fn mark_delivered(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE messages SET delivered = 1 WHERE id = ? AND delivered = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_delivered(&self, id: &str) -> Result<bool, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT delivered FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some_and(|(delivered,)| delivered))
    }

    async fn pending_for(&self, receiver: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT id, sender, receiver, text, timestamp, delivered
            FROM messages
            WHERE receiver = ? AND delivered = 0
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(receiver)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT id, sender, receiver, text, timestamp, delivered
            FROM messages
            WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?)
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
