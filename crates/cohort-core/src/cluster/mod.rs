//! Cluster roles and their wire protocol.
//!
//! A manager node coordinates query execution across shard nodes over
//! persistent TCP connections carrying length-prefixed bincode frames.
//! Shards run the workers; the manager resolves queries, fans plans out and
//! merges partial results.

pub mod execution;
pub mod manager;
pub mod protocol;
pub mod shard;

pub use execution::{ExecutionManager, ExecutionState, ExecutionStatus, StructuredError};
pub use manager::ManagerNode;
pub use protocol::{ClusterMessage, MessageKind, PROTOCOL_VERSION};
pub use shard::ShardNode;
