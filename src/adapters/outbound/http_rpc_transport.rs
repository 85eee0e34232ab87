//! HTTP RPC Transport
//!
//! Implements RpcTransport as JSON over HTTP(S) with reqwest.
//!
//! - `POST /v1/query` runs statements and transaction control
//! - `GET /v1/replication-ids` lists databases
//! - `GET /v1/replicas/{id}` downloads a replica image

use crate::domain::entities::Endpoint;
use crate::domain::ports::{RpcReply, RpcRequest, RpcResponse, RpcTransport};
use crate::domain::value_objects::{Params, QueryResult, SessionId, Value};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "x-litesql-session";

/// Header carrying the server sequence on replica downloads.
pub const TXSEQ_HEADER: &str = "x-litesql-txseq";

/// Statement kind on the wire.
const TYPE_UNSPECIFIED: u8 = 0;
const TYPE_QUERY: u8 = 1;
const TYPE_UPDATE: u8 = 2;

#[derive(Debug, Serialize)]
struct NamedValue<'a> {
    ordinal: usize,
    value: &'a Value,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    replication_id: &'a str,
    sql: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    params: Vec<NamedValue<'a>>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    #[serde(default)]
    rows_affected: u64,
    #[serde(default)]
    txseq: u64,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct ReplicationIdsResponse {
    #[serde(default)]
    replication_id: Vec<String>,
    #[serde(default)]
    txseq: u64,
}

/// reqwest-based transport.
pub struct HttpRpcTransport {
    client: reqwest::Client,
}

impl HttpRpcTransport {
    /// Create a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Protocol(format!("client error: {}", e)))?;
        Ok(Self { client })
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        endpoint: &Endpoint,
        session: &SessionId,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header(SESSION_HEADER, session.as_str());
        match &endpoint.token {
            Some(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    async fn query(
        &self,
        endpoint: &Endpoint,
        session: &SessionId,
        database: &str,
        sql: &str,
        kind: u8,
        params: &Params,
    ) -> Result<QueryResponse> {
        let body = QueryRequest {
            replication_id: database,
            sql,
            kind,
            params: params
                .iter()
                .map(|(ordinal, value)| NamedValue { ordinal, value })
                .collect(),
        };

        let url = format!("{}/v1/query", endpoint.base_url());
        let response = self
            .authorize(self.client.post(&url), endpoint, session)
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let reply: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;

        if !reply.error.is_empty() {
            return Err(Error::Rejected(reply.error));
        }
        Ok(reply)
    }
}

/// Map a failed send to the error taxonomy.
///
/// Only connect-phase failures are `Unreachable`; anything later may have
/// been delivered.
fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else if e.is_connect() {
        Error::Unreachable(e.to_string())
    } else {
        Error::Interrupted(e.to_string())
    }
}

/// Map non-success statuses to the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} - {}", status, body);
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY => Err(Error::Rejected(detail)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(Error::Timeout),
        _ => Err(Error::Interrupted(detail)),
    }
}

fn rows_of(reply: QueryResponse) -> QueryResult {
    QueryResult {
        columns: reply.columns,
        rows: reply.rows,
        rows_affected: reply.rows_affected,
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        session: &SessionId,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        match request {
            RpcRequest::ExecuteQuery {
                database,
                sql,
                params,
            } => {
                let reply = self
                    .query(endpoint, session, &database, &sql, TYPE_QUERY, &params)
                    .await?;
                let txseq = reply.txseq;
                Ok(RpcResponse::new(RpcReply::Rows(rows_of(reply)), txseq))
            }
            RpcRequest::ExecuteUpdate {
                database,
                sql,
                params,
            } => {
                let reply = self
                    .query(endpoint, session, &database, &sql, TYPE_UPDATE, &params)
                    .await?;
                Ok(RpcResponse::new(
                    RpcReply::RowsAffected(reply.rows_affected),
                    reply.txseq,
                ))
            }
            RpcRequest::Execute {
                database,
                sql,
                params,
            } => {
                let reply = self
                    .query(endpoint, session, &database, &sql, TYPE_UNSPECIFIED, &params)
                    .await?;
                let txseq = reply.txseq;
                Ok(RpcResponse::new(RpcReply::Result(rows_of(reply)), txseq))
            }
            RpcRequest::BeginTx { database } => {
                self.control(endpoint, session, &database, "BEGIN").await
            }
            RpcRequest::Commit { database } => {
                self.control(endpoint, session, &database, "COMMIT").await
            }
            RpcRequest::Rollback { database } => {
                self.control(endpoint, session, &database, "ROLLBACK").await
            }
            RpcRequest::ListReplicationIds => {
                let url = format!("{}/v1/replication-ids", endpoint.base_url());
                let response = self
                    .authorize(self.client.get(&url), endpoint, session)
                    .send()
                    .await
                    .map_err(map_send_error)?;
                let response = check_status(response).await?;
                let body: ReplicationIdsResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Protocol(e.to_string()))?;
                Ok(RpcResponse::new(
                    RpcReply::ReplicationIds(body.replication_id),
                    body.txseq,
                ))
            }
            RpcRequest::DownloadReplica { database } => {
                let url = format!("{}/v1/replicas/{}", endpoint.base_url(), database);
                let response = self
                    .authorize(self.client.get(&url), endpoint, session)
                    .send()
                    .await
                    .map_err(map_send_error)?;
                let response = check_status(response).await?;
                let txseq = response
                    .headers()
                    .get(TXSEQ_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let image = response.bytes().await.map_err(map_send_error)?;
                Ok(RpcResponse::new(RpcReply::ReplicaImage(image), txseq))
            }
        }
    }
}

impl HttpRpcTransport {
    async fn control(
        &self,
        endpoint: &Endpoint,
        session: &SessionId,
        database: &str,
        sql: &str,
    ) -> Result<RpcResponse> {
        let reply = self
            .query(endpoint, session, database, sql, TYPE_UNSPECIFIED, &Params::new())
            .await?;
        Ok(RpcResponse::new(RpcReply::Done, reply.txseq))
    }
}
