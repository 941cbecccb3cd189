//! Error taxonomy for the send path.
//!
//! Route absence and connection push failures are not errors; a message for
//! an unreachable receiver simply stays queued until their next registration.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Empty sender, receiver, or text. Rejected before anything is persisted
    /// and reported only to the offending connection.
    #[error("invalid message: empty {0}")]
    InvalidMessage(&'static str),

    /// The message store could not be reached. The message was not queued;
    /// the sender has to retry.
    #[error("message store unavailable: {0}")]
    Store(#[from] StoreError),
}
