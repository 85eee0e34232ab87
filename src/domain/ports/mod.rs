mod change_feed;
mod cursor_store;
mod replica_source;
mod replica_store;
mod rpc_transport;

pub use change_feed::{ChangeFeed, FeedSubscription};
pub use cursor_store::CursorStore;
pub use replica_source::ReplicaSource;
pub use replica_store::{ReadHandle, ReplicaStore};
pub use rpc_transport::{RpcReply, RpcRequest, RpcResponse, RpcTransport};
