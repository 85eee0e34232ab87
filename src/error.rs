//! Error Taxonomy
//!
//! One error type for every layer of the client. Transport failures are split
//! by retryability; replication errors never reach query callers (they drive
//! resync or a fallback to the server instead).

use crate::config::ConfigError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request never reached a server. Retryable, triggers failover.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The request may have reached a server but no usable answer came
    /// back (5xx status, connection dropped mid-response).
    #[error("request interrupted: {0}")]
    Interrupted(String),

    /// Deadline exceeded before a response was observed.
    #[error("operation timed out")]
    Timeout,

    /// The server validated and declined the request (bad SQL, auth).
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// A change batch does not start where the replica ends.
    #[error("sequence gap: replica at {expected}, batch starts at {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    /// The server reported the commit as failed. Roll back before reuse.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// The commit may or may not have been applied. Never retried.
    #[error("commit outcome unknown; check the server before retrying")]
    CommitUnknown,

    #[error("a transaction is already active")]
    AlreadyInTransaction,

    #[error("no active transaction")]
    NoActiveTransaction,

    /// A previous commit failed or timed out and was not rolled back yet.
    #[error("previous commit is unresolved; roll back first")]
    TransactionUnresolved,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("parameter index {0} is invalid (indexes start at 1)")]
    InvalidParameterIndex(usize),

    #[error("catalog name cannot be empty")]
    InvalidCatalog,

    #[error("change batch {base}..{end} failed checksum verification")]
    CorruptBatch { base: u64, end: u64 },

    /// A read handle would observe an older sequence than it already saw.
    #[error("replica regressed from sequence {seen} to {found}")]
    ReplicaRegressed { seen: u64, found: u64 },

    #[error("not a valid replica image: {0}")]
    InvalidReplicaImage(String),

    #[error("replication feed disconnected: {0}")]
    FeedDisconnected(String),

    /// The feed no longer holds history at the requested position.
    #[error("replication feed history truncated (earliest available {earliest})")]
    FeedTruncated { earliest: u64 },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same call elsewhere could succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_transport()
    }

    /// Whether the error says anything about endpoint health.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::Interrupted(_) | Error::Timeout
        )
    }

    /// Whether the server may have acted on the request anyway.
    pub fn may_have_been_applied(&self) -> bool {
        matches!(self, Error::Interrupted(_) | Error::Timeout)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
