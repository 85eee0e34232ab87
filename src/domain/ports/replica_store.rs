//! Replica Store Port
//!
//! Defines the interface to a local, read-only copy of one database.

use crate::domain::entities::{ChangeBatch, ReplicaSnapshot};
use crate::domain::value_objects::{Params, QueryResult};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Local replica of a single database.
///
/// The replication feed is the only writer; any number of read handles may
/// query concurrently. A single query never observes a mix of pre- and
/// post-apply rows.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Database (replication id) this replica mirrors.
    fn database(&self) -> &str;

    /// Apply a change batch atomically and return the new sequence.
    ///
    /// Batches ending at or before the current sequence are no-ops. A batch
    /// whose base differs from the current sequence fails with
    /// `Error::SequenceGap` and leaves the replica untouched.
    async fn apply(&self, batch: &ChangeBatch) -> Result<u64>;

    /// Last applied sequence number.
    fn current_sequence(&self) -> u64;

    /// Sequence and time of the last apply.
    fn snapshot(&self) -> ReplicaSnapshot;

    /// Open a read handle with monotonic-read guarantees.
    async fn open_read_handle(&self) -> Result<Box<dyn ReadHandle>>;

    /// Replace the whole replica with a downloaded image.
    ///
    /// Returns the sequence embedded in the image.
    async fn install(&self, image: Bytes) -> Result<u64>;
}

/// Read access to a replica, bound to one session.
#[async_trait]
pub trait ReadHandle: Send + Sync {
    /// Run a read-only statement against a consistent snapshot.
    ///
    /// Fails with `Error::ReplicaRegressed` if the snapshot is older than
    /// one this handle has already observed.
    async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult>;

    /// Highest sequence this handle has observed.
    fn observed_sequence(&self) -> u64;
}
