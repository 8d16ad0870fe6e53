//! Coordination layer of the metadata service: the durable procedure
//! engine and its kinds, outbound event dispatch to data nodes, the
//! reconciliation scheduler with its placement pickers, the entry lock,
//! and flow-limited admission for external procedures.

pub mod dispatch;
pub mod limiter;
pub mod lock;
pub mod picker;
pub mod procedure;
pub mod scheduler;

pub use dispatch::{
    DispatchCall, EventDispatch, HttpEventDispatch, MockEventDispatch,
};
pub use limiter::FlowLimiter;
pub use lock::EntryLock;
pub use picker::{
    ConsistentUniformHashNodePicker, LeastTableShardPicker, NodePicker, ShardAffinityRule,
    ShardAffinityStore, ShardPicker,
};
pub use procedure::{
    Procedure, ProcedureCtx, ProcedureHandle, ProcedureInfo, ProcedureKind, ProcedureManager,
    StepOutcome,
};
pub use scheduler::Scheduler;
