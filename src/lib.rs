//! litesql-ha Library
//!
//! Client-side high availability for a remote SQL server: failover across
//! server endpoints, reads served from locally replicated SQLite files when
//! they are fresh enough, and every write sent to the authoritative server.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use application::{Connection, DataSource, DataSourceBuilder, ReplicationFeed};
pub use config::{load_config, Config, ConfigError};
pub use domain::entities::{ChangeBatch, FeedState, ReplicaSnapshot, TransactionState};
pub use domain::ports::{ChangeFeed, CursorStore, ReplicaSource, ReplicaStore, RpcTransport};
pub use domain::services::{RemoteReason, Route, Router};
pub use domain::value_objects::{FreshnessPolicy, Params, QueryResult, StatementKind, Value};
pub use error::{Error, Result};
