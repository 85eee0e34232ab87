mod dashmap_cursor_store;
mod http_change_feed;
mod http_rpc_transport;
mod in_memory_change_feed;
mod sqlite_cursor_store;
mod sqlite_replica_store;

pub use dashmap_cursor_store::DashMapCursorStore;
pub use http_change_feed::{subject, HttpChangeFeed};
pub use http_rpc_transport::{HttpRpcTransport, SESSION_HEADER, TXSEQ_HEADER};
pub use in_memory_change_feed::InMemoryChangeFeed;
pub use sqlite_cursor_store::{SqliteCursorStore, CURSOR_FILE};
pub use sqlite_replica_store::{
    is_replica_file, is_replica_image, SqliteReadHandle, SqliteReplicaStore, MIN_REPLICA_SIZE,
    SQLITE_HEADER,
};
