//! Durable, restartable procedures.
//!
//! A procedure is a named state machine over the cluster metadata. Its
//! whole resumable state is a serde value persisted at every step
//! boundary; runtime dependencies (metadata handle, dispatch client) come
//! in through [`ProcedureCtx`] so a procedure deserialized after a crash
//! is indistinguishable from a fresh one.
//!
//! Step discipline: every externally visible effect is either idempotent
//! given the persisted state or preceded by a KV CAS that rejects replays.
//! KV writes happen before the dispatch RPCs they authorize; a re-sent
//! RPC carries the same shard version and data nodes treat it as a no-op.

pub mod create_table;
pub mod drop_table;
pub mod manager;
pub mod partition_table;
pub mod reopen;
pub mod scatter;
pub mod split;
pub mod transfer_leader;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tessera_common::{MetaError, MetaResult, ShardId, ShardStatus};
use tessera_meta::{ClusterMetadata, ShardInfo};

use crate::dispatch::{EventDispatch, TableInfo, UpdateShardInfo};

pub use create_table::CreateTableProcedure;
pub use drop_table::DropTableProcedure;
pub use manager::{ProcedureHandle, ProcedureInfo, ProcedureManager};
pub use partition_table::{CreatePartitionTableProcedure, DropPartitionTableProcedure};
pub use reopen::{CloseShardProcedure, OpenShardProcedure};
pub use scatter::ScatterProcedure;
pub use split::SplitProcedure;
pub use transfer_leader::TransferLeaderProcedure;

/// The closed set of procedure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureKind {
    CreateTable,
    DropTable,
    TransferLeader,
    Split,
    CreatePartitionTable,
    DropPartitionTable,
    Scatter,
    Open,
    Close,
}

impl ProcedureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::CreateTable => "create_table",
            ProcedureKind::DropTable => "drop_table",
            ProcedureKind::TransferLeader => "transfer_leader",
            ProcedureKind::Split => "split",
            ProcedureKind::CreatePartitionTable => "create_partition_table",
            ProcedureKind::DropPartitionTable => "drop_partition_table",
            ProcedureKind::Scatter => "scatter",
            ProcedureKind::Open => "open",
            ProcedureKind::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<ProcedureKind> {
        Some(match s {
            "create_table" => ProcedureKind::CreateTable,
            "drop_table" => ProcedureKind::DropTable,
            "transfer_leader" => ProcedureKind::TransferLeader,
            "split" => ProcedureKind::Split,
            "create_partition_table" => ProcedureKind::CreatePartitionTable,
            "drop_partition_table" => ProcedureKind::DropPartitionTable,
            "scatter" => ProcedureKind::Scatter,
            "open" => ProcedureKind::Open,
            "close" => ProcedureKind::Close,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More steps remain; persist state and continue.
    Continue,
    /// The procedure reached its terminal success state.
    Finished,
}

/// Runtime dependencies handed to every step.
#[derive(Clone)]
pub struct ProcedureCtx {
    pub meta: Arc<ClusterMetadata>,
    pub dispatch: Arc<dyn EventDispatch>,
}

/// The closed union of all procedures. Per design, a sum type with
/// per-variant data instead of open polymorphism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Procedure {
    CreateTable(CreateTableProcedure),
    DropTable(DropTableProcedure),
    TransferLeader(TransferLeaderProcedure),
    Split(SplitProcedure),
    CreatePartitionTable(CreatePartitionTableProcedure),
    DropPartitionTable(DropPartitionTableProcedure),
    Scatter(ScatterProcedure),
    Open(OpenShardProcedure),
    Close(CloseShardProcedure),
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::CreateTable(_) => ProcedureKind::CreateTable,
            Procedure::DropTable(_) => ProcedureKind::DropTable,
            Procedure::TransferLeader(_) => ProcedureKind::TransferLeader,
            Procedure::Split(_) => ProcedureKind::Split,
            Procedure::CreatePartitionTable(_) => ProcedureKind::CreatePartitionTable,
            Procedure::DropPartitionTable(_) => ProcedureKind::DropPartitionTable,
            Procedure::Scatter(_) => ProcedureKind::Scatter,
            Procedure::Open(_) => ProcedureKind::Open,
            Procedure::Close(_) => ProcedureKind::Close,
        }
    }

    /// The entry-lock set: shards this procedure's effects touch.
    pub fn related_shards(&self) -> Vec<u64> {
        let mut shards: Vec<u64> = match self {
            Procedure::CreateTable(p) => vec![p.shard_id.0 as u64],
            Procedure::DropTable(p) => p.shard_id.iter().map(|s| s.0 as u64).collect(),
            Procedure::TransferLeader(p) => vec![p.shard_id.0 as u64],
            Procedure::Split(p) => vec![p.old_shard.0 as u64, p.new_shard.0 as u64],
            Procedure::CreatePartitionTable(p) => {
                let mut s: Vec<u64> = p.sub_shards.iter().map(|s| s.0 as u64).collect();
                s.push(p.root_shard.0 as u64);
                s
            }
            Procedure::DropPartitionTable(p) => {
                p.table_shards.iter().map(|s| s.0 as u64).collect()
            }
            Procedure::Scatter(p) => p.assignment.iter().map(|(s, _)| s.0 as u64).collect(),
            Procedure::Open(p) => vec![p.shard_id.0 as u64],
            Procedure::Close(p) => vec![p.shard_id.0 as u64],
        };
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    /// Serialize the resumable state.
    pub fn raw_state(&self) -> MetaResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| MetaError::Codec(e.to_string()))
    }

    /// Rebuild a procedure from its persisted state.
    pub fn from_raw_state(value: serde_json::Value) -> MetaResult<Procedure> {
        serde_json::from_value(value).map_err(|e| MetaError::Codec(e.to_string()))
    }

    /// Run the next step.
    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self {
            Procedure::CreateTable(p) => p.step(ctx).await,
            Procedure::DropTable(p) => p.step(ctx).await,
            Procedure::TransferLeader(p) => p.step(ctx).await,
            Procedure::Split(p) => p.step(ctx).await,
            Procedure::CreatePartitionTable(p) => p.step(ctx).await,
            Procedure::DropPartitionTable(p) => p.step(ctx).await,
            Procedure::Scatter(p) => p.step(ctx).await,
            Procedure::Open(p) => p.step(ctx).await,
            Procedure::Close(p) => p.step(ctx).await,
        }
    }
}

// ── Helpers shared by the kinds ─────────────────────────────────────────────

/// The endpoint of a shard's current leader, or `StaleSnapshot` when the
/// shard has none.
pub(crate) fn leader_endpoint(meta: &ClusterMetadata, shard_id: ShardId) -> MetaResult<String> {
    meta.snapshot()
        .topology
        .leader_of(shard_id)
        .map(|sn| sn.node_name.clone())
        .ok_or_else(|| MetaError::StaleSnapshot(format!("{shard_id} has no leader")))
}

/// The `ShardInfo` a dispatch request must carry for a shard, built from
/// the committed shard view.
pub(crate) fn current_shard_info(meta: &ClusterMetadata, shard_id: ShardId) -> MetaResult<ShardInfo> {
    let view = meta
        .shard_view(shard_id)
        .ok_or(MetaError::ShardNotFound(shard_id))?;
    Ok(ShardInfo {
        shard_id,
        role: tessera_common::ShardRole::Leader,
        version: view.version,
        status: ShardStatus::Ready,
    })
}

pub(crate) fn update_shard_info(meta: &ClusterMetadata, shard_id: ShardId) -> MetaResult<UpdateShardInfo> {
    Ok(UpdateShardInfo {
        curr_shard_info: current_shard_info(meta, shard_id)?,
    })
}

pub(crate) fn table_info(
    table: &tessera_storage::TableRecord,
    schema_name: &str,
) -> TableInfo {
    TableInfo {
        id: table.id,
        name: table.name.clone(),
        schema_id: table.schema_id,
        schema_name: schema_name.to_string(),
    }
}
