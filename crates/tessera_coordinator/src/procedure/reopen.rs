//! Open/Close: single-shard dispatch procedures.
//!
//! Open re-sends a shard to the node the cluster view says owns it —
//! issued by the scheduler when a recovered node heartbeats without a
//! shard it should be serving. Close asks a node to stop serving a shard.

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{MetaError, MetaResult, ShardId};
use tessera_meta::ClusterSnapshot;

use crate::dispatch::{CloseShardRequest, OpenShardRequest};
use crate::procedure::{current_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenShardProcedure {
    pub shard_id: ShardId,
    pub node_name: String,
}

impl OpenShardProcedure {
    pub fn new(snapshot: &ClusterSnapshot, shard_id: ShardId) -> MetaResult<Self> {
        let leader = snapshot
            .topology
            .leader_of(shard_id)
            .ok_or_else(|| MetaError::StaleSnapshot(format!("{shard_id} has no owner to reopen")))?;
        Ok(Self {
            shard_id,
            node_name: leader.node_name.clone(),
        })
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        // Re-validate ownership against the current view; the shard may
        // have moved since this procedure was scheduled.
        let current = ctx
            .meta
            .snapshot()
            .topology
            .leader_of(self.shard_id)
            .map(|sn| sn.node_name.clone());
        if current.as_deref() != Some(self.node_name.as_str()) {
            return Err(MetaError::StaleSnapshot(format!(
                "{} moved to {current:?}",
                self.shard_id
            )));
        }
        let shard = current_shard_info(&ctx.meta, self.shard_id)?;
        ctx.dispatch
            .open_shard(&self.node_name, OpenShardRequest { shard })
            .await?;
        info!(shard = %self.shard_id, node = %self.node_name, "shard reopened");
        Ok(StepOutcome::Finished)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseShardProcedure {
    pub shard_id: ShardId,
    pub node_name: String,
}

impl CloseShardProcedure {
    pub fn new(shard_id: ShardId, node_name: impl Into<String>) -> Self {
        Self {
            shard_id,
            node_name: node_name.into(),
        }
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        ctx.dispatch
            .close_shard(
                &self.node_name,
                CloseShardRequest {
                    shard_id: self.shard_id,
                },
            )
            .await?;
        info!(shard = %self.shard_id, node = %self.node_name, "shard closed");
        Ok(StepOutcome::Finished)
    }
}
