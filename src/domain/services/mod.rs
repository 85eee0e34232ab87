mod router;

pub use router::{RemoteReason, ReplicaStatus, Route, Router, TransactionCommand};
