//! Scripted transport and fixtures for unit tests.

use crate::domain::entities::Endpoint;
use crate::domain::ports::{RpcReply, RpcRequest, RpcResponse, RpcTransport};
use crate::domain::value_objects::{QueryResult, SessionId, Value};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// In-process transport whose behavior is scripted per endpoint address.
///
/// Queued replies are consumed first; otherwise the endpoint answers with a
/// default reply for the request, or `Unreachable` once marked as failed.
#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<String, VecDeque<Result<RpcResponse>>>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, RpcRequest)>>,
    txseq: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot result for `address`.
    pub fn push(&self, address: &str, result: Result<RpcResponse>) {
        self.queued
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make every call to `address` fail with `Unreachable`.
    pub fn fail(&self, address: &str) {
        self.failing.lock().insert(address.to_string());
    }

    pub fn recover(&self, address: &str) {
        self.failing.lock().remove(address);
    }

    /// Delay every call to `address`.
    pub fn delay(&self, address: &str, delay: Duration) {
        self.delays.lock().insert(address.to_string(), delay);
    }

    /// Transaction sequence reported with default replies.
    pub fn set_txseq(&self, txseq: u64) {
        self.txseq.store(txseq, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, RpcRequest)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, address: &str) -> usize {
        self.calls.lock().iter().filter(|(a, _)| a == address).count()
    }

    /// Names of requests sent to `address`, in order.
    pub fn requests_to(&self, address: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, r)| r.name())
            .collect()
    }

    fn default_reply(&self, request: &RpcRequest) -> RpcResponse {
        let reply = match request {
            RpcRequest::ExecuteQuery { .. } => RpcReply::Rows(QueryResult {
                columns: vec!["source".to_string()],
                rows: vec![vec![Value::Text("server".to_string())]],
                rows_affected: 0,
            }),
            RpcRequest::ExecuteUpdate { .. } => RpcReply::RowsAffected(1),
            RpcRequest::Execute { .. } => RpcReply::Result(QueryResult::affected(1)),
            RpcRequest::BeginTx { .. } | RpcRequest::Commit { .. } | RpcRequest::Rollback { .. } => {
                RpcReply::Done
            }
            RpcRequest::ListReplicationIds => RpcReply::ReplicationIds(Vec::new()),
            RpcRequest::DownloadReplica { .. } => RpcReply::ReplicaImage(bytes::Bytes::new()),
        };
        RpcResponse::new(reply, self.txseq.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        _session: &SessionId,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        let address = endpoint.address.clone();
        self.calls.lock().push((address.clone(), request.clone()));

        let delay = self.delays.lock().get(&address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .get_mut(&address)
            .and_then(|q| q.pop_front());
        if let Some(result) = queued {
            return result;
        }

        if self.failing.lock().contains(&address) {
            return Err(Error::Unreachable(format!("{} refused connection", address)));
        }

        Ok(self.default_reply(&request))
    }
}
