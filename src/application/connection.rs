//! Connection - the caller-facing session
//!
//! Owns one remote link and, lazily, one replica read handle. Every statement
//! passes through the transaction state machine and the router; reads that
//! the router sends to the replica fall back to the server if the local read
//! fails.

use crate::application::remote_link::{CallKind, RemoteLink};
use crate::application::replica_set::ReplicaSet;
use crate::application::replication_feed::ReplicationFeed;
use crate::domain::entities::{Endpoint, TransactionState};
use crate::domain::ports::{ReadHandle, RpcReply, RpcRequest};
use crate::domain::services::{RemoteReason, Route, Router, TransactionCommand};
use crate::domain::value_objects::{
    FreshnessPolicy, Params, QueryResult, SessionId, StatementKind,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Caller-visible session settings.
#[derive(Debug, Clone)]
struct Session {
    auto_commit: bool,
    read_only: bool,
    catalog: String,
    transaction: TransactionState,
}

/// Read handle bound to the replica it was opened on.
struct Reader {
    database: String,
    handle: Box<dyn ReadHandle>,
}

/// Which server operation a statement maps to.
#[derive(Debug, Clone, Copy)]
enum Statement {
    Query,
    Update,
    Any,
}

/// A session against the HA server and its local replicas.
pub struct Connection {
    link: Arc<RemoteLink>,
    replicas: Arc<ReplicaSet>,
    policy: FreshnessPolicy,
    session: Session,
    reader: Option<Reader>,
    last_route: Option<Route>,
    closed: bool,
}

impl Connection {
    pub fn new(
        link: Arc<RemoteLink>,
        replicas: Arc<ReplicaSet>,
        catalog: impl Into<String>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            link,
            replicas,
            policy,
            session: Session {
                auto_commit: true,
                read_only: false,
                catalog: catalog.into(),
                transaction: TransactionState::None,
            },
            reader: None,
            last_route: None,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.link.session()
    }

    pub fn auto_commit(&self) -> bool {
        self.session.auto_commit
    }

    pub fn read_only(&self) -> bool {
        self.session.read_only
    }

    pub fn catalog(&self) -> &str {
        &self.session.catalog
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.session.transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Server endpoint the session is attached to, once a call was made.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.link.endpoint()
    }

    /// Where the last statement was executed.
    pub fn last_route(&self) -> Option<Route> {
        self.last_route
    }

    pub fn query_timeout(&self) -> Duration {
        self.link.timeout()
    }

    pub fn set_query_timeout(&mut self, timeout: Duration) {
        self.link.set_timeout(timeout);
    }

    /// Run a statement that returns rows.
    pub async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        self.dispatch(sql, params, Statement::Query).await
    }

    /// Run a statement that modifies rows and return the affected count.
    pub async fn execute(&mut self, sql: &str, params: &Params) -> Result<u64> {
        let result = self.dispatch(sql, params, Statement::Update).await?;
        Ok(result.rows_affected)
    }

    /// Run any statement.
    pub async fn run(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        self.dispatch(sql, params, Statement::Any).await
    }

    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.resolve_interrupted_commit()?;
        if self.session.transaction != TransactionState::None {
            return Err(Error::AlreadyInTransaction);
        }
        self.send_begin().await
    }

    /// Commit the active transaction.
    ///
    /// A commit that may have reached the server without an answer is never
    /// retried: the session moves to the unknown state and the caller gets
    /// `CommitUnknown`.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.resolve_interrupted_commit()?;
        match self.session.transaction {
            TransactionState::None => return Err(Error::NoActiveTransaction),
            TransactionState::Failed | TransactionState::Unknown => {
                return Err(Error::TransactionUnresolved)
            }
            TransactionState::Active | TransactionState::Committing => {}
        }

        self.session.transaction = TransactionState::Committing;
        let request = RpcRequest::Commit {
            database: self.session.catalog.clone(),
        };

        match self.link.call(request, CallKind::Commit).await {
            Ok(_) => {
                self.session.transaction = TransactionState::None;
                tracing::debug!("session {} committed", self.link.session());
                Ok(())
            }
            Err(e) if e.may_have_been_applied() => {
                self.session.transaction = TransactionState::Unknown;
                tracing::warn!(
                    "session {} commit outcome unknown: {}",
                    self.link.session(),
                    e
                );
                Err(Error::CommitUnknown)
            }
            Err(e) => {
                self.session.transaction = TransactionState::Failed;
                tracing::warn!("session {} commit failed: {}", self.link.session(), e);
                Err(Error::CommitFailed(e.to_string()))
            }
        }
    }

    /// Roll back the transaction. Always returns the session to no transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.session.transaction == TransactionState::None {
            return Err(Error::NoActiveTransaction);
        }

        self.send_rollback().await;
        self.session.transaction = TransactionState::None;
        Ok(())
    }

    /// Switch auto-commit mode.
    ///
    /// Disabling starts a transaction right away; enabling commits the
    /// active one.
    pub async fn set_auto_commit(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.resolve_interrupted_commit()?;
        if enabled == self.session.auto_commit {
            return Ok(());
        }

        if enabled {
            if self.session.transaction == TransactionState::Active {
                self.commit().await?;
            }
            self.session.auto_commit = true;
        } else {
            self.session.auto_commit = false;
            if self.session.transaction == TransactionState::None {
                self.send_begin().await?;
            }
        }
        Ok(())
    }

    /// Mark the session read-only on the server.
    pub async fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        if self.session.transaction.is_open() {
            return Err(Error::AlreadyInTransaction);
        }

        let request = RpcRequest::Execute {
            database: self.session.catalog.clone(),
            sql: format!("PRAGMA query_only = {}", u8::from(read_only)),
            params: Params::new(),
        };
        self.link.call(request, CallKind::Write).await?;
        self.session.read_only = read_only;
        Ok(())
    }

    /// Switch the database this session addresses.
    pub fn set_catalog(&mut self, catalog: &str) -> Result<()> {
        self.ensure_open()?;
        let catalog = catalog.trim();
        if catalog.is_empty() {
            return Err(Error::InvalidCatalog);
        }
        if self.session.transaction.is_open() {
            return Err(Error::AlreadyInTransaction);
        }

        if catalog != self.session.catalog {
            tracing::debug!(
                "session {} catalog {} -> {}",
                self.link.session(),
                self.session.catalog,
                catalog
            );
            self.session.catalog = catalog.to_string();
            self.reader = None;
        }
        Ok(())
    }

    /// Whether the server answers within `timeout`.
    pub async fn is_valid(&self, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        tokio::time::timeout(timeout, self.link.probe(&self.session.catalog))
            .await
            .unwrap_or(false)
    }

    /// Close the session, rolling back any open transaction. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.session.transaction.is_open() {
            self.send_rollback().await;
            self.session.transaction = TransactionState::None;
        }
        self.reader = None;
        tracing::debug!("session {} closed", self.link.session());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// A commit whose future was dropped leaves the session committing.
    fn resolve_interrupted_commit(&mut self) -> Result<()> {
        if self.session.transaction == TransactionState::Committing {
            tracing::warn!(
                "session {} commit was interrupted, outcome unknown",
                self.link.session()
            );
            self.session.transaction = TransactionState::Unknown;
            return Err(Error::CommitUnknown);
        }
        Ok(())
    }

    async fn send_begin(&mut self) -> Result<()> {
        let request = RpcRequest::BeginTx {
            database: self.session.catalog.clone(),
        };
        self.link.call(request, CallKind::Write).await?;
        self.session.transaction = TransactionState::Active;
        tracing::debug!("session {} began transaction", self.link.session());
        Ok(())
    }

    async fn send_rollback(&self) {
        let request = RpcRequest::Rollback {
            database: self.session.catalog.clone(),
        };
        if let Err(e) = self.link.call(request, CallKind::InTransaction).await {
            tracing::warn!("session {} rollback failed: {}", self.link.session(), e);
        }
    }

    async fn dispatch(
        &mut self,
        sql: &str,
        params: &Params,
        statement: Statement,
    ) -> Result<QueryResult> {
        self.ensure_open()?;
        self.resolve_interrupted_commit()?;

        if let Some(command) = Router::transaction_command(sql) {
            match command {
                TransactionCommand::Begin => self.begin_transaction().await?,
                TransactionCommand::Commit => self.commit().await?,
                TransactionCommand::Rollback => self.rollback().await?,
            }
            return Ok(QueryResult::default());
        }

        if matches!(
            self.session.transaction,
            TransactionState::Failed | TransactionState::Unknown
        ) {
            return Err(Error::TransactionUnresolved);
        }
        if !self.session.auto_commit && self.session.transaction == TransactionState::None {
            self.send_begin().await?;
        }

        let kind = Router::classify(sql);
        let feed = match kind {
            StatementKind::Read => self.replicas.lookup(&self.session.catalog),
            _ => None,
        };
        let status = feed.as_ref().map(|f| f.status());
        let route = Router::route(
            kind,
            self.session.transaction,
            status.as_ref(),
            self.link.txseq(),
            &self.policy,
            SystemTime::now(),
        );
        self.last_route = Some(route);

        match (route, feed) {
            (Route::Replica, Some(feed)) => match self.read_replica(&feed, sql, params).await {
                Ok(result) => {
                    tracing::debug!(
                        "session {} read served by replica {}",
                        self.link.session(),
                        feed.database()
                    );
                    return Ok(result);
                }
                Err(e) => {
                    tracing::warn!(
                        "replica read on {} failed, using server: {}",
                        feed.database(),
                        e
                    );
                    self.last_route = Some(Route::Remote(RemoteReason::ReplicaFailed));
                }
            },
            (Route::Remote(reason), _) => {
                tracing::debug!("session {} routed to server: {}", self.link.session(), reason);
            }
            (Route::Replica, None) => {}
        }

        self.remote(sql, params, statement, kind).await
    }

    async fn read_replica(
        &mut self,
        feed: &ReplicationFeed,
        sql: &str,
        params: &Params,
    ) -> Result<QueryResult> {
        let mut reader = match self.reader.take() {
            Some(reader) if reader.database == feed.database() => reader,
            _ => Reader {
                database: feed.database().to_string(),
                handle: feed.store().open_read_handle().await?,
            },
        };
        let result = reader.handle.query(sql, params).await;
        // Keep the handle so it remembers the highest sequence it observed
        self.reader = Some(reader);
        result
    }

    async fn remote(
        &mut self,
        sql: &str,
        params: &Params,
        statement: Statement,
        kind: StatementKind,
    ) -> Result<QueryResult> {
        let database = self.session.catalog.clone();
        let sql = sql.to_string();
        let params = params.clone();
        let request = match statement {
            Statement::Query => RpcRequest::ExecuteQuery {
                database,
                sql,
                params,
            },
            Statement::Update => RpcRequest::ExecuteUpdate {
                database,
                sql,
                params,
            },
            Statement::Any => RpcRequest::Execute {
                database,
                sql,
                params,
            },
        };

        let call_kind = if self.session.transaction.is_open() {
            CallKind::InTransaction
        } else if kind == StatementKind::Read {
            CallKind::Read
        } else {
            CallKind::Write
        };

        match self.link.call(request, call_kind).await?.reply {
            RpcReply::Rows(result) | RpcReply::Result(result) => Ok(result),
            RpcReply::RowsAffected(count) => Ok(QueryResult::affected(count)),
            RpcReply::Done => Ok(QueryResult::default()),
            other => Err(Error::Protocol(format!(
                "unexpected reply to a statement: {:?}",
                other
            ))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed || !self.session.transaction.is_open() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(
                    "session {} dropped with an open transaction outside a runtime",
                    self.link.session()
                );
                return;
            }
        };

        let link = self.link.clone();
        let request = RpcRequest::Rollback {
            database: self.session.catalog.clone(),
        };
        runtime.spawn(async move {
            if let Err(e) = link.call(request, CallKind::InTransaction).await {
                tracing::warn!("session {} rollback on drop failed: {}", link.session(), e);
            }
        });
    }
}
