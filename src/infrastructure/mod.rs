//! Infrastructure Layer
//!
//! Cross-cutting components: endpoint failover, reconnect backoff and
//! background task shutdown.

pub mod backoff;
pub mod failover;
pub mod shutdown;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use failover::{FailoverConfig, FailoverSupervisor};
pub use shutdown::ShutdownController;
