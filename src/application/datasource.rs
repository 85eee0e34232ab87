//! Data Source - composition root
//!
//! Builds the shared failover supervisor, transport and one replication feed
//! per replica file found in the replica directory, then hands out
//! connections that share them. Closing the data source stops every
//! background task it started.

use crate::adapters::outbound::{
    is_replica_file, is_replica_image, HttpChangeFeed, HttpRpcTransport, SqliteCursorStore,
    SqliteReplicaStore,
};
use crate::application::connection::Connection;
use crate::application::remote_link::RemoteLink;
use crate::application::remote_replica_source::RemoteReplicaSource;
use crate::application::replica_set::ReplicaSet;
use crate::application::replication_feed::{FeedSettings, ReplicationFeed};
use crate::config::Config;
use crate::domain::entities::{FeedState, ReplicaSnapshot};
use crate::domain::ports::{ChangeFeed, CursorStore, ReplicaSource, RpcTransport};
use crate::error::{Error, Result};
use crate::infrastructure::{BackoffConfig, FailoverConfig, FailoverSupervisor, ShutdownController};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long `close` waits for background tasks before aborting them.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Future returned by the closure given to [`DataSource::with_connection`].
pub type ConnectionFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Builder for [`DataSource`] with injectable adapters.
pub struct DataSourceBuilder {
    config: Config,
    transport: Option<Arc<dyn RpcTransport>>,
    change_feed: Option<Arc<dyn ChangeFeed>>,
    cursor_store: Option<Arc<dyn CursorStore>>,
    replica_source: Option<Arc<dyn ReplicaSource>>,
    feed_backoff: Option<BackoffConfig>,
    health_listener: Option<HealthListener>,
}

type HealthListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

impl DataSourceBuilder {
    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.change_feed = Some(feed);
        self
    }

    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = Some(store);
        self
    }

    /// Where full images come from on resync. Defaults to the server.
    pub fn replica_source(mut self, source: Arc<dyn ReplicaSource>) -> Self {
        self.replica_source = Some(source);
        self
    }

    pub fn feed_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.feed_backoff = Some(backoff);
        self
    }

    /// Called with (address, healthy) whenever an endpoint changes health.
    pub fn on_health_change<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.health_listener = Some(Arc::new(listener));
        self
    }

    /// Validate the configuration and start background work.
    pub async fn build(self) -> Result<DataSource> {
        let config = self.config;
        config.validate()?;

        let endpoints = config.endpoints()?;
        let default_catalog = endpoints
            .first()
            .map(|e| e.database.clone())
            .unwrap_or_default();

        let transport: Arc<dyn RpcTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpRpcTransport::new(config.connect_timeout)?),
        };

        let mut supervisor = FailoverSupervisor::new(endpoints, FailoverConfig::from(&config));
        if let Some(listener) = self.health_listener {
            supervisor = supervisor.on_health_change(move |address, healthy| listener(address, healthy));
        }
        let supervisor = Arc::new(supervisor);
        let shutdown = ShutdownController::new();
        let mut tasks = vec![supervisor.start(transport.clone(), &shutdown)];

        let replicas = Arc::new(ReplicaSet::new());
        let change_feed = self.change_feed.or_else(|| {
            config.replication_url.as_ref().map(|url| {
                Arc::new(HttpChangeFeed::new(url.clone(), config.replication_stream.clone()))
                    as Arc<dyn ChangeFeed>
            })
        });

        if let (Some(dir), Some(change_feed), Some(mut settings)) = (
            config.replicas_dir.clone(),
            change_feed,
            FeedSettings::from_config(&config),
        ) {
            if let Some(backoff) = self.feed_backoff {
                settings.backoff = backoff;
            }
            tokio::fs::create_dir_all(&dir).await?;

            let cursors: Arc<dyn CursorStore> = match self.cursor_store {
                Some(store) => store,
                None => Arc::new(SqliteCursorStore::in_dir(&dir)?),
            };
            let source: Arc<dyn ReplicaSource> = match self.replica_source {
                Some(source) => source,
                None => Arc::new(RemoteReplicaSource::new(Arc::new(RemoteLink::new(
                    transport.clone(),
                    supervisor.clone(),
                    &config,
                )))),
            };

            for path in scan_replicas(&dir).await? {
                let store = SqliteReplicaStore::open(&path)?;
                let feed = Arc::new(ReplicationFeed::new(
                    Arc::new(store),
                    change_feed.clone(),
                    cursors.clone(),
                    source.clone(),
                    settings.clone(),
                ));
                tasks.push(feed.start(&shutdown));
                replicas.insert(feed);
            }

            if replicas.is_empty() {
                tracing::warn!("no replicas found in {}", dir.display());
            }
        }

        tracing::info!(
            "data source ready with {} endpoint(s) and {} replica(s)",
            supervisor.endpoints().len(),
            replicas.len()
        );

        Ok(DataSource {
            config,
            default_catalog,
            transport,
            supervisor,
            replicas,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

/// Replica files in `dir`, sorted by name. Dotfiles are skipped.
async fn scan_replicas(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if is_replica_file(&path) {
            found.push(path);
        } else {
            tracing::debug!("skipping {}: not a replica", path.display());
        }
    }

    found.sort();
    Ok(found)
}

/// Shared entry point that hands out connections.
pub struct DataSource {
    config: Config,
    default_catalog: String,
    transport: Arc<dyn RpcTransport>,
    supervisor: Arc<FailoverSupervisor>,
    replicas: Arc<ReplicaSet>,
    shutdown: ShutdownController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DataSource {
    pub fn builder(config: Config) -> DataSourceBuilder {
        DataSourceBuilder {
            config,
            transport: None,
            change_feed: None,
            cursor_store: None,
            replica_source: None,
            feed_backoff: None,
            health_listener: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<FailoverSupervisor> {
        &self.supervisor
    }

    /// Databases with a local replica.
    pub fn replicas(&self) -> Vec<String> {
        self.replicas.databases()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn link(&self) -> Arc<RemoteLink> {
        Arc::new(RemoteLink::new(
            self.transport.clone(),
            self.supervisor.clone(),
            &self.config,
        ))
    }

    /// Open a new session on the database named in the first URL.
    pub fn get_connection(&self) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(Connection::new(
            self.link(),
            self.replicas.clone(),
            self.default_catalog.clone(),
            self.config.freshness(),
        ))
    }

    /// Run `f` with a fresh connection that is closed on every exit path.
    ///
    /// ```ignore
    /// let count = ds
    ///     .with_connection(|conn| Box::pin(async move {
    ///         conn.execute("DELETE FROM sessions", &Params::new()).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> ConnectionFuture<'c, T>,
    {
        let mut conn = self.get_connection()?;
        let result = f(&mut conn).await;
        conn.close().await;
        result
    }

    /// Download every database the server replicates into `dir`.
    ///
    /// Existing files are kept unless `overwrite` is set. Returns the paths
    /// written.
    pub async fn download_replicas(
        &self,
        dir: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let link = self.link();
        let mut written = Vec::new();

        for database in link.replication_ids().await? {
            if database.is_empty()
                || database.starts_with('.')
                || database.contains(|c: char| c == '/' || c == '\\')
            {
                tracing::warn!("skipping replica with unusable name {:?}", database);
                continue;
            }

            let path = dir.join(&database);
            if !overwrite && tokio::fs::try_exists(&path).await? {
                tracing::debug!("replica {} already present", path.display());
                continue;
            }

            let image = link.download_replica(&database).await?;
            if !is_replica_image(&image) {
                return Err(Error::InvalidReplicaImage(format!(
                    "{} ({} bytes)",
                    database,
                    image.len()
                )));
            }

            let staging = dir.join(format!(".{}.download", database));
            tokio::fs::write(&staging, &image).await?;
            tokio::fs::rename(&staging, &path).await?;

            tracing::info!("downloaded replica {} ({} bytes)", database, image.len());
            written.push(path);
        }

        Ok(written)
    }

    /// Feed state of the replica for `database`.
    pub fn replication_state(&self, database: &str) -> Option<FeedState> {
        self.replicas.get(database).map(|feed| feed.state())
    }

    pub fn replica_snapshot(&self, database: &str) -> Option<ReplicaSnapshot> {
        self.replicas.get(database).map(|feed| feed.store().snapshot())
    }

    /// Stop replication feeds and the probe loop. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.shutdown.join(tasks, STOP_TIMEOUT).await;
        tracing::info!("data source closed");
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.shutdown.shutdown();
        }
    }
}
