//! DashMap Cursor Store
//!
//! Implements CursorStore in memory. Cursors do not survive a restart, so a
//! feed using it resumes from the replica's embedded sequence.

use crate::domain::entities::ReplicationCursor;
use crate::domain::ports::CursorStore;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory cursor store keyed by (database, durable).
pub struct DashMapCursorStore {
    cursors: DashMap<(String, String), ReplicationCursor>,
}

impl DashMapCursorStore {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

impl Default for DashMapCursorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CursorStore for DashMapCursorStore {
    async fn load(&self, database: &str, durable: &str) -> Result<Option<ReplicationCursor>> {
        Ok(self
            .cursors
            .get(&(database.to_string(), durable.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn save(&self, cursor: &ReplicationCursor) -> Result<()> {
        self.cursors.insert(
            (cursor.database.clone(), cursor.durable.clone()),
            cursor.clone(),
        );
        Ok(())
    }
}
