//! Change Feed Port
//!
//! Defines the interface to the replication log: an ordered, at-least-once
//! stream of change batches per database with durable consumer positions.

use crate::domain::entities::ChangeBatch;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Subscribable replication log.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe as `durable` to the log of `database`, delivering batches
    /// that end after `from_seq`.
    ///
    /// Fails with `Error::FeedTruncated` when the log no longer holds
    /// history at `from_seq`, or `Error::FeedDisconnected` on transport
    /// failure.
    async fn subscribe(
        &self,
        database: &str,
        durable: &str,
        from_seq: u64,
    ) -> Result<Box<dyn FeedSubscription>>;
}

/// An active subscription.
#[async_trait]
pub trait FeedSubscription: Send {
    /// Fetch up to `max` batches, waiting at most `wait` for the first one.
    ///
    /// An empty vector means nothing arrived in time.
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<ChangeBatch>>;

    /// Acknowledge everything up to and including `sequence`.
    async fn ack(&mut self, sequence: u64) -> Result<()>;
}
