//! Application Layer
//!
//! Sessions, replication consumers and the data source that wires them to
//! the outbound adapters.

pub mod connection;
pub mod datasource;
pub mod remote_link;
pub mod remote_replica_source;
pub mod replica_set;
pub mod replication_feed;

pub use connection::Connection;
pub use datasource::{ConnectionFuture, DataSource, DataSourceBuilder};
pub use remote_link::{CallKind, RemoteLink};
pub use remote_replica_source::RemoteReplicaSource;
pub use replica_set::ReplicaSet;
pub use replication_feed::{FeedSettings, ReplicationFeed};
