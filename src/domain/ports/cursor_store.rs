//! Cursor Store Port
//!
//! Defines the interface for persisting replication consumer positions.

use crate::domain::entities::ReplicationCursor;
use crate::error::Result;
use async_trait::async_trait;

/// Durable storage for replication cursors, keyed by (database, durable name).
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the cursor for a consumer, if one was saved.
    async fn load(&self, database: &str, durable: &str) -> Result<Option<ReplicationCursor>>;

    /// Persist a cursor, replacing any previous position.
    async fn save(&self, cursor: &ReplicationCursor) -> Result<()>;
}
