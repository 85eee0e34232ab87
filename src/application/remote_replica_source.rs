//! Replica images downloaded from the active server endpoint.

use crate::application::remote_link::RemoteLink;
use crate::domain::ports::ReplicaSource;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Fetches full replica images through a dedicated remote link.
pub struct RemoteReplicaSource {
    link: Arc<RemoteLink>,
}

impl RemoteReplicaSource {
    pub fn new(link: Arc<RemoteLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl ReplicaSource for RemoteReplicaSource {
    async fn fetch_replica(&self, database: &str) -> Result<Bytes> {
        let image = self.link.download_replica(database).await?;
        tracing::info!("downloaded {} byte image of {}", image.len(), database);
        Ok(image)
    }
}
