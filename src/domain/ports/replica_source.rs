//! Replica Source Port
//!
//! Defines where full replica images come from during resynchronization.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Source of complete replica images.
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Download the current full image of `database`.
    async fn fetch_replica(&self, database: &str) -> Result<Bytes>;
}
