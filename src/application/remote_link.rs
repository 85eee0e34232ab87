//! Remote Link - per-session channel to the HA server
//!
//! Sends requests through the transport with a per-call deadline, applies the
//! retry policy for each call kind, and reports endpoint health to the
//! failover supervisor. The link never picks endpoints itself; it reconnects
//! to whatever the supervisor names as active.

use crate::config::Config;
use crate::domain::entities::Endpoint;
use crate::domain::ports::{RpcReply, RpcRequest, RpcResponse, RpcTransport};
use crate::domain::value_objects::{Params, SessionId};
use crate::error::{Error, Result};
use crate::infrastructure::FailoverSupervisor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Retry class of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Reads, probes and metadata: retried on any transport failure
    Read,
    /// Writes outside a transaction: retried only when the request never
    /// reached a server
    Write,
    /// Anything inside a transaction: pinned to the current endpoint
    InTransaction,
    /// Commit: pinned and never retried
    Commit,
}

impl CallKind {
    fn pinned(&self) -> bool {
        matches!(self, CallKind::InTransaction | CallKind::Commit)
    }

    fn may_retry(&self, error: &Error) -> bool {
        match self {
            CallKind::Read => error.is_retryable(),
            CallKind::Write => matches!(error, Error::Unreachable(_)),
            CallKind::InTransaction | CallKind::Commit => false,
        }
    }
}

/// Channel from one session to the currently active server endpoint.
pub struct RemoteLink {
    transport: Arc<dyn RpcTransport>,
    supervisor: Arc<FailoverSupervisor>,
    session: SessionId,
    endpoint: Mutex<Option<Endpoint>>,
    timeout_ms: AtomicU64,
    max_attempts: u32,
    timeout_threshold: u32,
    consecutive_timeouts: AtomicU32,
    /// Highest server sequence observed on this link
    txseq: AtomicU64,
}

impl RemoteLink {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        supervisor: Arc<FailoverSupervisor>,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            supervisor,
            session: SessionId::new(),
            endpoint: Mutex::new(None),
            timeout_ms: AtomicU64::new(config.query_timeout.as_millis() as u64),
            max_attempts: config.max_attempts.max(1),
            timeout_threshold: config.timeout_threshold.max(1),
            consecutive_timeouts: AtomicU32::new(0),
            txseq: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Endpoint the link is currently attached to.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().clone()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    /// Override the per-call deadline.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest transaction sequence observed on this link.
    pub fn txseq(&self) -> u64 {
        self.txseq.load(Ordering::SeqCst)
    }

    fn observe(&self, txseq: u64) {
        self.txseq.fetch_max(txseq, Ordering::SeqCst);
    }

    /// Attach the link to `endpoint`.
    pub fn reconnect(&self, endpoint: Endpoint) {
        let mut current = self.endpoint.lock();
        if let Some(previous) = current.as_ref() {
            if previous.address != endpoint.address {
                tracing::info!(
                    "session {} reconnecting from {} to {}",
                    self.session,
                    previous.address,
                    endpoint.address
                );
            }
        }
        *current = Some(endpoint);
    }

    /// Endpoint for the next attempt.
    ///
    /// Pinned calls stay on the attached endpoint even if it was reported
    /// unhealthy in the meantime.
    fn current_endpoint(&self, pinned: bool) -> Result<Endpoint> {
        if let Some(endpoint) = self.endpoint.lock().as_ref() {
            if pinned || self.supervisor.is_eligible(endpoint) {
                return Ok(endpoint.clone());
            }
        }
        let next = self.supervisor.active_endpoint()?;
        self.reconnect(next.clone());
        Ok(next)
    }

    /// Send `request`, retrying as `kind` allows.
    pub async fn call(&self, request: RpcRequest, kind: CallKind) -> Result<RpcResponse> {
        let max_attempts = if kind.pinned() { 1 } else { self.max_attempts };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let endpoint = self.current_endpoint(kind.pinned())?;

            let result = tokio::time::timeout(
                self.timeout(),
                self.transport
                    .call(&endpoint, &self.session, request.clone()),
            )
            .await
            .unwrap_or(Err(Error::Timeout));

            match result {
                Ok(response) => {
                    self.consecutive_timeouts.store(0, Ordering::SeqCst);
                    self.observe(response.txseq);
                    self.supervisor.report_success(&endpoint);
                    return Ok(response);
                }
                Err(error) => {
                    self.record_failure(&endpoint, &error);

                    if attempt >= max_attempts || !kind.may_retry(&error) {
                        return Err(error);
                    }
                    tracing::debug!(
                        "retrying {} after {} (attempt {}/{})",
                        request.name(),
                        error,
                        attempt,
                        max_attempts
                    );
                }
            }
        }
    }

    fn record_failure(&self, endpoint: &Endpoint, error: &Error) {
        match error {
            Error::Unreachable(reason) | Error::Interrupted(reason) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                let _ = self.supervisor.report_failure(endpoint, reason);
            }
            Error::Timeout => {
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.timeout_threshold {
                    self.consecutive_timeouts.store(0, Ordering::SeqCst);
                    let reason = format!("{} consecutive timeouts", count);
                    let _ = self.supervisor.report_failure(endpoint, &reason);
                }
            }
            // The server answered, so the endpoint is reachable
            _ => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                self.supervisor.report_success(endpoint);
            }
        }
    }

    /// Check that the active endpoint answers a trivial query.
    pub async fn probe(&self, database: &str) -> bool {
        let request = RpcRequest::ExecuteQuery {
            database: database.to_string(),
            sql: "SELECT 1".to_string(),
            params: Params::new(),
        };
        self.call(request, CallKind::Read).await.is_ok()
    }

    /// List the databases the server replicates.
    pub async fn replication_ids(&self) -> Result<Vec<String>> {
        match self
            .call(RpcRequest::ListReplicationIds, CallKind::Read)
            .await?
            .reply
        {
            RpcReply::ReplicationIds(ids) => Ok(ids),
            other => Err(Error::Protocol(format!(
                "expected replication ids, got {:?}",
                other
            ))),
        }
    }

    /// Download a full replica image for `database`.
    pub async fn download_replica(&self, database: &str) -> Result<Bytes> {
        let request = RpcRequest::DownloadReplica {
            database: database.to_string(),
        };
        match self.call(request, CallKind::Read).await?.reply {
            RpcReply::ReplicaImage(image) => Ok(image),
            other => Err(Error::Protocol(format!(
                "expected replica image, got {:?}",
                other
            ))),
        }
    }
}
