//! In-memory cluster metadata model.
//!
//! [`ClusterMetadata`] owns the cached view of one cluster — schemas,
//! tables, shard views, the cluster view, and the node registry — and every
//! mutator follows the same discipline: write the KV with CAS first, update
//! the cache under the writer lock on success, never hold the lock across
//! I/O. Readers take value-copied snapshots.

pub mod manager;
pub mod metadata;
pub mod topology;

pub use manager::{ClusterManager, CreateClusterOpts};
pub use metadata::{ClusterMetadata, RegisteredNode, RouteEntry, ShardTables};
pub use topology::{ClusterSnapshot, ShardInfo, Topology};
