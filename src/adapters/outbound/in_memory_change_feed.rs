//! In-Memory Change Feed
//!
//! Implements ChangeFeed with an in-process log per database. Used by tests
//! and embedders that produce change batches in the same process. Supports
//! history truncation and injected disconnects.

use crate::domain::entities::ChangeBatch;
use crate::domain::ports::{ChangeFeed, FeedSubscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct FeedLog {
    batches: Vec<ChangeBatch>,
    /// Entries removed from the front by truncation
    dropped: usize,
    /// First sequence still available to new subscribers
    earliest: u64,
}

#[derive(Default)]
struct Inner {
    logs: RwLock<HashMap<String, FeedLog>>,
    acks: DashMap<(String, String), u64>,
    published: Notify,
    pending_disconnects: AtomicUsize,
    pending_subscribe_failures: AtomicUsize,
}

/// In-process change feed.
#[derive(Clone, Default)]
pub struct InMemoryChangeFeed {
    inner: Arc<Inner>,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch to its database's log.
    pub fn publish(&self, batch: ChangeBatch) {
        self.inner
            .logs
            .write()
            .entry(batch.database.clone())
            .or_default()
            .batches
            .push(batch);
        self.inner.published.notify_waiters();
    }

    /// Drop history up to and including `sequence`.
    pub fn truncate(&self, database: &str, sequence: u64) {
        let mut logs = self.inner.logs.write();
        let log = logs.entry(database.to_string()).or_default();
        let keep_from = log
            .batches
            .iter()
            .position(|b| b.end_seq > sequence)
            .unwrap_or(log.batches.len());
        log.batches.drain(..keep_from);
        log.dropped += keep_from;
        log.earliest = log.earliest.max(sequence);
        self.inner.published.notify_waiters();
    }

    /// Fail the next `count` fetches across all subscriptions.
    pub fn disconnect(&self, count: usize) {
        self.inner
            .pending_disconnects
            .fetch_add(count, Ordering::SeqCst);
        self.inner.published.notify_waiters();
    }

    /// Fail the next `count` subscribe calls.
    pub fn fail_subscribes(&self, count: usize) {
        self.inner
            .pending_subscribe_failures
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Highest sequence acknowledged by `durable` for `database`.
    pub fn acked(&self, database: &str, durable: &str) -> Option<u64> {
        self.inner
            .acks
            .get(&(database.to_string(), durable.to_string()))
            .map(|e| *e.value())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(
        &self,
        database: &str,
        durable: &str,
        from_seq: u64,
    ) -> Result<Box<dyn FeedSubscription>> {
        if take_one(&self.inner.pending_subscribe_failures) {
            return Err(Error::FeedDisconnected("subscribe refused".to_string()));
        }

        let next = {
            let logs = self.inner.logs.read();
            match logs.get(database) {
                Some(log) if from_seq < log.earliest => {
                    return Err(Error::FeedTruncated {
                        earliest: log.earliest,
                    })
                }
                Some(log) => {
                    log.dropped
                        + log
                            .batches
                            .iter()
                            .position(|b| b.end_seq > from_seq)
                            .unwrap_or(log.batches.len())
                }
                None => 0,
            }
        };

        Ok(Box::new(InMemorySubscription {
            inner: self.inner.clone(),
            database: database.to_string(),
            durable: durable.to_string(),
            next,
        }))
    }
}

/// Cursor into one database's log.
struct InMemorySubscription {
    inner: Arc<Inner>,
    database: String,
    durable: String,
    /// Absolute index of the next entry to deliver
    next: usize,
}

impl InMemorySubscription {
    fn poll(&mut self, max: usize) -> Result<Vec<ChangeBatch>> {
        if take_one(&self.inner.pending_disconnects) {
            return Err(Error::FeedDisconnected("connection reset".to_string()));
        }

        let logs = self.inner.logs.read();
        let Some(log) = logs.get(&self.database) else {
            return Ok(Vec::new());
        };
        if self.next < log.dropped {
            return Err(Error::FeedTruncated {
                earliest: log.earliest,
            });
        }

        let start = self.next - log.dropped;
        let batches: Vec<ChangeBatch> = log.batches.iter().skip(start).take(max).cloned().collect();
        self.next += batches.len();
        Ok(batches)
    }
}

#[async_trait]
impl FeedSubscription for InMemorySubscription {
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<ChangeBatch>> {
        let published = self.inner.clone();
        let notified = published.published.notified();

        let batches = self.poll(max)?;
        if !batches.is_empty() {
            return Ok(batches);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.poll(max)
    }

    async fn ack(&mut self, sequence: u64) -> Result<()> {
        self.inner
            .acks
            .entry((self.database.clone(), self.durable.clone()))
            .and_modify(|acked| *acked = (*acked).max(sequence))
            .or_insert(sequence);
        Ok(())
    }
}
