//! Domain Entities - Core client objects
//!
//! Endpoints the client can talk to, change batches delivered by the
//! replication feed, and the state that tracks both.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Transport security for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    Plain,
    Tls,
}

impl SecurityMode {
    pub fn scheme(&self) -> &'static str {
        match self {
            SecurityMode::Plain => "http",
            SecurityMode::Tls => "https",
        }
    }
}

/// Last-known health of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    Unhealthy,
    /// Not contacted yet
    Unknown,
}

impl std::fmt::Display for EndpointHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointHealth::Healthy => write!(f, "healthy"),
            EndpointHealth::Unhealthy => write!(f, "unhealthy"),
            EndpointHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// A server endpoint the client may route calls to.
///
/// Endpoints are created from configuration and never removed; the failover
/// supervisor only flips their health.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// host:port
    pub address: String,
    /// Replication id (database name) taken from the URL path
    pub database: String,
    pub security: SecurityMode,
    /// Bearer token sent with every call
    pub token: Option<String>,
    pub health: EndpointHealth,
    pub last_failure: Option<Instant>,
}

impl Endpoint {
    pub fn new(
        address: impl Into<String>,
        database: impl Into<String>,
        security: SecurityMode,
        token: Option<String>,
    ) -> Self {
        Self {
            address: address.into(),
            database: database.into(),
            security,
            token,
            health: EndpointHealth::Unknown,
            last_failure: None,
        }
    }

    /// Base URL for HTTP-style transports.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.security.scheme(), self.address)
    }

    /// Whether the endpoint may receive calls at `now`.
    ///
    /// Unhealthy endpoints become eligible again once `cooldown` has passed
    /// since their last failure.
    pub fn is_eligible(&self, now: Instant, cooldown: Duration) -> bool {
        match self.health {
            EndpointHealth::Healthy | EndpointHealth::Unknown => true,
            EndpointHealth::Unhealthy => self
                .last_failure
                .map(|at| now.saturating_duration_since(at) >= cooldown)
                .unwrap_or(true),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// An ordered slice of the replication log for one database.
///
/// Applying the batch moves a replica from `base_seq` to `end_seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub database: String,
    pub base_seq: u64,
    pub end_seq: u64,
    /// SQL statements, executed in order
    pub statements: Vec<String>,
    /// Server commit time in milliseconds since UNIX epoch
    pub committed_at_ms: u64,
    /// CRC32 checksum for integrity
    pub checksum: u32,
}

impl ChangeBatch {
    /// Create a new batch, computing its checksum.
    pub fn new(
        database: impl Into<String>,
        base_seq: u64,
        end_seq: u64,
        statements: Vec<String>,
    ) -> Self {
        let database = database.into();
        let checksum = Self::compute_checksum(&database, base_seq, end_seq, &statements);
        Self {
            database,
            base_seq,
            end_seq,
            statements,
            committed_at_ms: now_ms(),
            checksum,
        }
    }

    /// Verify the checksum.
    pub fn verify(&self) -> bool {
        self.checksum
            == Self::compute_checksum(&self.database, self.base_seq, self.end_seq, &self.statements)
    }

    fn compute_checksum(database: &str, base_seq: u64, end_seq: u64, statements: &[String]) -> u32 {
        let bytes = bincode::serialize(&(database, base_seq, end_seq, statements)).unwrap_or_default();
        crc32fast::hash(&bytes)
    }
}

/// Applied state of a local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaSnapshot {
    /// Last applied sequence number
    pub sequence: u64,
    /// Wall-clock time of the last apply or install
    pub applied_at: Option<SystemTime>,
}

impl ReplicaSnapshot {
    /// Time since the last apply, or None if nothing was ever applied.
    pub fn staleness(&self, now: SystemTime) -> Option<Duration> {
        self.applied_at
            .map(|at| now.duration_since(at).unwrap_or(Duration::ZERO))
    }
}

/// Durable consumer position in the replication log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationCursor {
    pub database: String,
    pub durable: String,
    pub sequence: u64,
    pub updated_at_ms: u64,
}

impl ReplicationCursor {
    pub fn new(database: impl Into<String>, durable: impl Into<String>, sequence: u64) -> Self {
        Self {
            database: database.into(),
            durable: durable.into(),
            sequence,
            updated_at_ms: now_ms(),
        }
    }
}

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    None,
    Active,
    /// Commit sent, outcome not observed yet
    Committing,
    /// Server reported the commit as failed
    Failed,
    /// Commit outcome unknown (timed out or interrupted)
    Unknown,
}

impl TransactionState {
    /// Whether statements must bypass the replica.
    pub fn is_open(&self) -> bool {
        !matches!(self, TransactionState::None)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::None => write!(f, "none"),
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committing => write!(f, "committing"),
            TransactionState::Failed => write!(f, "commit-failed"),
            TransactionState::Unknown => write!(f, "commit-unknown"),
        }
    }
}

/// State of a replication feed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedState {
    #[default]
    Disconnected,
    Subscribing,
    Streaming,
    Resyncing,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedState::Disconnected => write!(f, "disconnected"),
            FeedState::Subscribing => write!(f, "subscribing"),
            FeedState::Streaming => write!(f, "streaming"),
            FeedState::Resyncing => write!(f, "resyncing"),
        }
    }
}

/// Milliseconds since UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
