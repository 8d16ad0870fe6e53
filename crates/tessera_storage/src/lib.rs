//! Persistence layer of the metadata service: a narrow adapter over a
//! linearizable key-value store, the hierarchical key layout, typed record
//! storage, and the batched ID allocator.
//!
//! Nothing in this crate caches: every call round-trips to the KV. The
//! in-memory view of the world lives one layer up, in `tessera_meta`.

pub mod id_alloc;
pub mod keys;
pub mod kv;
pub mod meta_store;

pub use id_alloc::{IdAllocator, ReusableIdAllocator, DEFAULT_ALLOC_STEP};
pub use kv::{KeyValue, KvBackend, LeaseId, MemKv, ScanPage, TxnGuard, TxnOp};
pub use meta_store::{
    ClusterRecord, ClusterViewRecord, MetaStorage, NodeRecord, NodeStats, PartitionInfo,
    ProcedureRecord, ProcedureState, SchemaRecord, ShardNode, ShardViewRecord, TableRecord,
};
