//! RPC Transport Port
//!
//! Defines the request/response interface to an HA server endpoint.
//! Implementations own the wire encoding; the client only sees these types.

use crate::domain::entities::Endpoint;
use crate::domain::value_objects::{Params, QueryResult, SessionId};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A single server operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    /// Run a statement that returns rows
    ExecuteQuery {
        database: String,
        sql: String,
        params: Params,
    },
    /// Run a statement that modifies rows
    ExecuteUpdate {
        database: String,
        sql: String,
        params: Params,
    },
    /// Run any statement
    Execute {
        database: String,
        sql: String,
        params: Params,
    },
    BeginTx {
        database: String,
    },
    Commit {
        database: String,
    },
    Rollback {
        database: String,
    },
    ListReplicationIds,
    /// Fetch a full replica image for a database
    DownloadReplica {
        database: String,
    },
}

impl RpcRequest {
    /// Operation name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::ExecuteQuery { .. } => "execute_query",
            RpcRequest::ExecuteUpdate { .. } => "execute_update",
            RpcRequest::Execute { .. } => "execute",
            RpcRequest::BeginTx { .. } => "begin",
            RpcRequest::Commit { .. } => "commit",
            RpcRequest::Rollback { .. } => "rollback",
            RpcRequest::ListReplicationIds => "replication_ids",
            RpcRequest::DownloadReplica { .. } => "download_replica",
        }
    }
}

/// Payload of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Rows(QueryResult),
    RowsAffected(u64),
    Result(QueryResult),
    Done,
    ReplicationIds(Vec<String>),
    ReplicaImage(Bytes),
}

/// Successful response with the server's transaction sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub reply: RpcReply,
    /// Latest transaction sequence known to the server (0 if not reported)
    pub txseq: u64,
}

impl RpcResponse {
    pub fn new(reply: RpcReply, txseq: u64) -> Self {
        Self { reply, txseq }
    }
}

/// Transport to an HA server.
///
/// Calls fail with `Error::Unreachable` (never reached a server),
/// `Error::Interrupted` (may have reached one), `Error::Rejected` (server
/// declined) or `Error::Timeout`. Implementations
/// must not retry or switch endpoints; that is the caller's job.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Perform one call against `endpoint` on behalf of `session`.
    async fn call(
        &self,
        endpoint: &Endpoint,
        session: &SessionId,
        request: RpcRequest,
    ) -> Result<RpcResponse>;
}
