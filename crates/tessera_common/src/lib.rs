//! Shared foundation for the Tessera metadata service: typed identifiers,
//! the error model, configuration, and the shutdown signal used by every
//! background loop.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use error::{ErrorCode, ErrorContext, ErrorKind, MetaError, MetaResult};
pub use shutdown::ShutdownSignal;
pub use types::{
    ClusterId, ClusterState, NodeState, ProcedureId, SchemaId, ShardId, ShardRole, ShardStatus,
    TableId, TopologyType,
};

/// Wall-clock milliseconds since the Unix epoch. Persisted records carry
/// `created_at`/`modified_at` in this unit.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
