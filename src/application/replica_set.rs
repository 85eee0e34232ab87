//! Replica Set
//!
//! Registry of the replication feeds a data source runs, keyed by database
//! name. Connections look their catalog up here to find a local replica.

use crate::application::replication_feed::ReplicationFeed;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ReplicaSet {
    feeds: DashMap<String, Arc<ReplicationFeed>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, feed: Arc<ReplicationFeed>) {
        self.feeds.insert(feed.database().to_string(), feed);
    }

    pub fn get(&self, database: &str) -> Option<Arc<ReplicationFeed>> {
        self.feeds.get(database).map(|e| e.value().clone())
    }

    /// Replica serving `catalog`.
    ///
    /// An empty catalog resolves to the only replica, if exactly one exists.
    pub fn lookup(&self, catalog: &str) -> Option<Arc<ReplicationFeed>> {
        if !catalog.is_empty() {
            return self.get(catalog);
        }
        if self.feeds.len() != 1 {
            return None;
        }
        self.feeds.iter().next().map(|e| e.value().clone())
    }

    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.feeds.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn feeds(&self) -> Vec<Arc<ReplicationFeed>> {
        self.feeds.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapCursorStore, InMemoryChangeFeed, SqliteReplicaStore};
    use crate::application::replication_feed::FeedSettings;
    use crate::domain::ports::ReplicaSource;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct NoSource;

    #[async_trait]
    impl ReplicaSource for NoSource {
        async fn fetch_replica(&self, database: &str) -> Result<Bytes> {
            Err(Error::Unreachable(database.to_string()))
        }
    }

    fn feed(dir: &TempDir, name: &str) -> Arc<ReplicationFeed> {
        let store = SqliteReplicaStore::open(dir.path().join(name)).unwrap();
        Arc::new(ReplicationFeed::new(
            Arc::new(store),
            Arc::new(InMemoryChangeFeed::new()),
            Arc::new(DashMapCursorStore::new()),
            Arc::new(NoSource),
            FeedSettings::new("c1"),
        ))
    }

    #[test]
    fn test_lookup_by_exact_name() {
        let dir = TempDir::new().unwrap();
        let set = ReplicaSet::new();
        set.insert(feed(&dir, "a.db"));
        set.insert(feed(&dir, "b.db"));

        assert_eq!(set.lookup("b.db").unwrap().database(), "b.db");
        assert!(set.lookup("c.db").is_none());
        assert_eq!(set.databases(), vec!["a.db", "b.db"]);
    }

    #[test]
    fn test_empty_catalog_needs_single_replica() {
        let dir = TempDir::new().unwrap();
        let set = ReplicaSet::new();
        assert!(set.lookup("").is_none());

        set.insert(feed(&dir, "a.db"));
        assert_eq!(set.lookup("").unwrap().database(), "a.db");

        set.insert(feed(&dir, "b.db"));
        assert!(set.lookup("").is_none());
    }
}
