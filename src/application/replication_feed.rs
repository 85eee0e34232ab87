//! Replication Feed - keeps one replica current
//!
//! Long-lived consumer that subscribes to the change feed at the durable
//! cursor, applies batches strictly in sequence order, persists the cursor,
//! acknowledges, and falls back to a full resync on gaps, corrupt batches
//! or truncated history. State is published on a watch channel for the router.

use crate::config::Config;
use crate::domain::entities::{ChangeBatch, FeedState, ReplicationCursor};
use crate::domain::ports::{ChangeFeed, CursorStore, FeedSubscription, ReplicaSource, ReplicaStore};
use crate::domain::services::ReplicaStatus;
use crate::error::{Error, Result};
use crate::infrastructure::{BackoffConfig, ExponentialBackoff, ShutdownController};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Durable consumer name
    pub durable: String,
    pub batch_size: usize,
    pub fetch_wait: Duration,
    pub backoff: BackoffConfig,
}

impl FeedSettings {
    pub fn new(durable: impl Into<String>) -> Self {
        Self {
            durable: durable.into(),
            batch_size: 10,
            fetch_wait: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        let durable = config.replication_durable.clone()?;
        Some(Self {
            durable,
            batch_size: config.fetch_batch_size.max(1),
            fetch_wait: config.fetch_wait,
            backoff: BackoffConfig::default(),
        })
    }
}

/// What ended a streaming session.
enum Interruption {
    Stopped,
    Resync,
    Disconnected,
}

/// Replication consumer for one database.
pub struct ReplicationFeed {
    database: String,
    store: Arc<dyn ReplicaStore>,
    feed: Arc<dyn ChangeFeed>,
    cursors: Arc<dyn CursorStore>,
    source: Arc<dyn ReplicaSource>,
    settings: FeedSettings,
    state: watch::Sender<FeedState>,
    /// Highest end sequence delivered by the feed
    head_seq: AtomicU64,
}

impl ReplicationFeed {
    pub fn new(
        store: Arc<dyn ReplicaStore>,
        feed: Arc<dyn ChangeFeed>,
        cursors: Arc<dyn CursorStore>,
        source: Arc<dyn ReplicaSource>,
        settings: FeedSettings,
    ) -> Self {
        let (state, _) = watch::channel(FeedState::Disconnected);
        Self {
            database: store.database().to_string(),
            head_seq: AtomicU64::new(store.current_sequence()),
            store,
            feed,
            cursors,
            source,
            settings,
            state,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    pub fn head_sequence(&self) -> u64 {
        self.head_seq.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    /// Routing view of this replica.
    pub fn status(&self) -> ReplicaStatus {
        let snapshot = self.store.snapshot();
        ReplicaStatus {
            feed_state: self.state(),
            head_sequence: self.head_sequence().max(snapshot.sequence),
            snapshot,
        }
    }

    fn set_state(&self, next: FeedState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("replica {} feed {} -> {}", self.database, previous, next);
        }
    }

    /// Start the consumer task.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownController) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        let stop = shutdown.subscribe();

        tokio::spawn(async move { feed.run(stop).await })
    }

    /// Consume until `stop` fires.
    pub async fn run(&self, mut stop: broadcast::Receiver<()>) {
        let mut backoff = ExponentialBackoff::new(self.settings.backoff.clone());
        let mut needs_resync = false;

        loop {
            if needs_resync {
                self.set_state(FeedState::Resyncing);
                let resync = tokio::select! {
                    r = self.resync() => r,
                    _ = stop.recv() => break,
                };
                match resync {
                    Ok(_) => needs_resync = false,
                    Err(e) => {
                        tracing::error!("resync of {} failed: {}", self.database, e);
                        self.set_state(FeedState::Disconnected);
                        if pause(&mut backoff, &mut stop).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            self.set_state(FeedState::Subscribing);
            let from = self.resume_position().await;
            let subscribed = tokio::select! {
                r = self.feed.subscribe(&self.database, &self.settings.durable, from) => r,
                _ = stop.recv() => break,
            };

            let mut subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(Error::FeedTruncated { earliest }) => {
                    tracing::warn!(
                        "feed history for {} starts at {}, replica at {}; resyncing",
                        self.database,
                        earliest,
                        from
                    );
                    needs_resync = true;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("subscribe for {} failed: {}", self.database, e);
                    self.set_state(FeedState::Disconnected);
                    if pause(&mut backoff, &mut stop).await {
                        break;
                    }
                    continue;
                }
            };

            backoff.reset();
            self.set_state(FeedState::Streaming);

            match self.stream(subscription.as_mut(), &mut stop).await {
                Interruption::Stopped => break,
                Interruption::Resync => needs_resync = true,
                Interruption::Disconnected => {
                    self.set_state(FeedState::Disconnected);
                    if pause(&mut backoff, &mut stop).await {
                        break;
                    }
                }
            }
        }

        self.set_state(FeedState::Disconnected);
        tracing::debug!("replica {} feed stopped", self.database);
    }

    async fn stream(
        &self,
        subscription: &mut dyn FeedSubscription,
        stop: &mut broadcast::Receiver<()>,
    ) -> Interruption {
        loop {
            let fetched = tokio::select! {
                r = subscription.fetch(self.settings.batch_size, self.settings.fetch_wait) => r,
                _ = stop.recv() => return Interruption::Stopped,
            };

            let batches = match fetched {
                Ok(batches) => batches,
                Err(e) => return self.interruption(e),
            };

            for batch in &batches {
                if let Err(e) = self.process_batch(batch).await {
                    return self.interruption(e);
                }
                if let Err(e) = subscription.ack(batch.end_seq).await {
                    return self.interruption(e);
                }
            }
        }
    }

    fn interruption(&self, error: Error) -> Interruption {
        match error {
            Error::SequenceGap { expected, found } => {
                tracing::warn!(
                    "gap on {}: replica at {}, feed delivered {}; resyncing",
                    self.database,
                    expected,
                    found
                );
                Interruption::Resync
            }
            Error::FeedTruncated { earliest } => {
                tracing::warn!(
                    "feed history for {} truncated at {}; resyncing",
                    self.database,
                    earliest
                );
                Interruption::Resync
            }
            Error::CorruptBatch { base, end } => {
                tracing::warn!(
                    "batch {}..{} for {} failed verification; resyncing",
                    base,
                    end,
                    self.database
                );
                Interruption::Resync
            }
            Error::Sqlite(e) => {
                tracing::warn!("applying to {} failed: {}; resyncing", self.database, e);
                Interruption::Resync
            }
            other => {
                tracing::warn!("feed for {} disconnected: {}", self.database, other);
                Interruption::Disconnected
            }
        }
    }

    /// Apply one batch and persist the cursor.
    ///
    /// Duplicates and already-applied batches leave the replica unchanged.
    pub async fn process_batch(&self, batch: &ChangeBatch) -> Result<u64> {
        self.head_seq.fetch_max(batch.end_seq, Ordering::SeqCst);

        let before = self.store.current_sequence();
        let sequence = self.store.apply(batch).await?;
        if sequence == before {
            tracing::debug!(
                "ignored batch {}..{} for {} at {}",
                batch.base_seq,
                batch.end_seq,
                self.database,
                sequence
            );
            return Ok(sequence);
        }

        self.cursors
            .save(&ReplicationCursor::new(
                &self.database,
                &self.settings.durable,
                sequence,
            ))
            .await?;
        Ok(sequence)
    }

    /// Sequence to subscribe from: the durable cursor, never past the replica.
    pub async fn resume_position(&self) -> u64 {
        let applied = self.store.current_sequence();
        match self
            .cursors
            .load(&self.database, &self.settings.durable)
            .await
        {
            Ok(Some(cursor)) => cursor.sequence.min(applied),
            Ok(None) => applied,
            Err(e) => {
                tracing::warn!("loading cursor for {} failed: {}", self.database, e);
                applied
            }
        }
    }

    /// Replace the replica with a fresh image and reset the cursor to it.
    pub async fn resync(&self) -> Result<u64> {
        let image = self.source.fetch_replica(&self.database).await?;
        let sequence = self.store.install(image).await?;

        self.cursors
            .save(&ReplicationCursor::new(
                &self.database,
                &self.settings.durable,
                sequence,
            ))
            .await?;
        self.head_seq.fetch_max(sequence, Ordering::SeqCst);

        tracing::info!("resynced {} to sequence {}", self.database, sequence);
        Ok(sequence)
    }
}

/// Sleep for the next backoff step. Returns true if stopped meanwhile.
async fn pause(backoff: &mut ExponentialBackoff, stop: &mut broadcast::Receiver<()>) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.recv() => true,
    }
}
