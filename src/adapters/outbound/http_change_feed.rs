//! HTTP Change Feed
//!
//! Implements ChangeFeed by pulling batches from a stream server over HTTP.
//! Each database is a subject `{stream}.{database}` (dots replaced by
//! underscores); consumers are identified by a durable name.
//!
//! - `PUT .../{subject}/consumers/{durable}` binds the consumer and returns
//!   the position the server has acknowledged
//! - `GET .../{subject}` long-polls for batches
//! - `POST .../{subject}/ack` acknowledges a sequence

use crate::domain::entities::ChangeBatch;
use crate::domain::ports::{ChangeFeed, FeedSubscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Extra time allowed on top of the long-poll wait.
const REQUEST_GRACE: Duration = Duration::from_secs(5);

/// Deadline for binding a consumer.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ConsumerRequest {
    from: u64,
}

#[derive(Debug, Deserialize)]
struct ConsumerResponse {
    #[serde(default)]
    acked: u64,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    batches: Vec<ChangeBatch>,
}

#[derive(Debug, Deserialize)]
struct TruncatedResponse {
    earliest: u64,
}

#[derive(Debug, Serialize)]
struct AckRequest<'a> {
    durable: &'a str,
    sequence: u64,
}

/// Subject name for a database on a stream.
pub fn subject(stream: &str, database: &str) -> String {
    format!("{}.{}", stream, database.replace('.', "_"))
}

/// HTTP pull-based change feed.
pub struct HttpChangeFeed {
    base_url: String,
    stream: String,
    client: reqwest::Client,
}

impl HttpChangeFeed {
    pub fn new(base_url: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stream: stream.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn subscribe(
        &self,
        database: &str,
        durable: &str,
        from_seq: u64,
    ) -> Result<Box<dyn FeedSubscription>> {
        let url = format!(
            "{}/v1/streams/{}/{}",
            self.base_url,
            self.stream,
            subject(&self.stream, database)
        );
        tracing::debug!("subscribing {} to {} from {}", durable, url, from_seq);

        let response = self
            .client
            .put(format!("{}/consumers/{}", url, durable))
            .json(&ConsumerRequest { from: from_seq })
            .timeout(SUBSCRIBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::FeedDisconnected(e.to_string()))?;

        let consumer: ConsumerResponse = check_feed_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;
        tracing::debug!(
            "consumer {} bound on {} (server acked {})",
            durable,
            subject(&self.stream, database),
            consumer.acked
        );

        Ok(Box::new(HttpSubscription {
            client: self.client.clone(),
            url,
            durable: durable.to_string(),
            after: from_seq,
        }))
    }
}

/// 410 means the history is gone; any other failure is a disconnect.
async fn check_feed_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == reqwest::StatusCode::GONE {
        let body: TruncatedResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;
        return Err(Error::FeedTruncated {
            earliest: body.earliest,
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::FeedDisconnected(format!("{} - {}", status, body)));
    }
    Ok(response)
}

struct HttpSubscription {
    client: reqwest::Client,
    url: String,
    durable: String,
    /// Highest end sequence delivered so far
    after: u64,
}

#[async_trait]
impl FeedSubscription for HttpSubscription {
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<ChangeBatch>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("durable", self.durable.clone()),
                ("after", self.after.to_string()),
                ("max", max.to_string()),
                ("wait_ms", wait.as_millis().to_string()),
            ])
            .timeout(wait + REQUEST_GRACE)
            .send()
            .await
            .map_err(|e| Error::FeedDisconnected(e.to_string()))?;

        let body: FetchResponse = check_feed_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;

        if let Some(last) = body.batches.iter().map(|b| b.end_seq).max() {
            self.after = self.after.max(last);
        }
        Ok(body.batches)
    }

    async fn ack(&mut self, sequence: u64) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/ack", self.url))
            .json(&AckRequest {
                durable: &self.durable,
                sequence,
            })
            .send()
            .await
            .map_err(|e| Error::FeedDisconnected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::FeedDisconnected(format!(
                "ack failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
