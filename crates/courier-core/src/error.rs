//! Error types for Courier.

use thiserror::Error;

/// Errors returned by sessions, the broker and the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Credentials were missing or rejected.
    #[error("Authentication failed")]
    Auth,

    /// Operation on a channel the session has no rights for.
    #[error("Permission denied")]
    PermissionDenied,

    /// Malformed request or payload.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Reserved for a strict subscribe policy. Sessions subscribe
    /// idempotently and never return it.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// The shard owning the channel is down.
    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    /// The backing store rejected a history or presence operation.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The session was torn down while a publish was in flight.
    #[error("Publish aborted")]
    PublishAborted,

    /// The session is not in the `Connected` state.
    #[error("Session is not connected")]
    NotConnected,

    /// The node is shutting down and no longer accepts connections.
    #[error("Node is closed")]
    Closed,

    /// Broker or shards could not be constructed.
    #[error("Fatal startup error: {0}")]
    FatalStartup(String),
}

impl Error {
    /// Numeric code sent to clients in error frames.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Error::Auth => 101,
            Error::PermissionDenied => 103,
            Error::BadRequest(_) => 107,
            Error::AlreadySubscribed(_) => 105,
            Error::ShardUnavailable(_) => 110,
            Error::StorageUnavailable(_) => 111,
            Error::PublishAborted => 112,
            Error::NotConnected => 113,
            Error::Closed => 114,
            Error::FatalStartup(_) => 100,
        }
    }

    /// Whether the caller may retry the operation.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::ShardUnavailable(_) | Error::StorageUnavailable(_) | Error::PublishAborted
        )
    }
}

/// Errors raised at the backing store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The connection to the store dropped; the shard must reconnect.
    #[error("Connection to store lost")]
    ConnectionLost,

    /// The store answered but could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
