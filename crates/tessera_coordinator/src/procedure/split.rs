//! Split: carve a subset of a shard's tables out into a freshly allocated
//! shard, placed on a target node.
//!
//! View commits run remove-then-add so a table is never on two committed
//! shard views; between the two commits it is transiently unplaced, which
//! the model allows.

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{MetaError, MetaResult, ShardId, TableId};
use tessera_meta::ClusterSnapshot;
use tessera_storage::ShardNode;

use crate::dispatch::OpenShardRequest;
use crate::procedure::{current_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    CreateView,
    CommitOld,
    CommitNew,
    CommitClusterView,
    DispatchOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitProcedure {
    pub old_shard: ShardId,
    pub new_shard: ShardId,
    /// Tables moving to the new shard.
    pub moving: Vec<TableId>,
    /// Node that will lead the new shard.
    pub target_node: String,
    step: Step,
}

impl SplitProcedure {
    /// `new_shard` must come from the cluster's shard allocator so it is
    /// unique; table names are resolved against the snapshot.
    pub fn new(
        snapshot: &ClusterSnapshot,
        old_shard: ShardId,
        new_shard: ShardId,
        moving: Vec<TableId>,
        target_node: impl Into<String>,
    ) -> MetaResult<Self> {
        let target_node = target_node.into();
        let old_view = snapshot
            .topology
            .shard_views
            .get(&old_shard)
            .ok_or(MetaError::ShardNotFound(old_shard))?;
        if !snapshot.nodes.contains_key(&target_node) {
            return Err(MetaError::NodeNotFound(target_node));
        }
        for table in &moving {
            if !old_view.table_ids.contains(table) {
                return Err(MetaError::InvalidArgument(format!(
                    "{table} is not on {old_shard}"
                )));
            }
        }
        Ok(Self {
            old_shard,
            new_shard,
            moving,
            target_node,
            step: Step::CreateView,
        })
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self.step {
            Step::CreateView => {
                if ctx.meta.shard_view(self.new_shard).is_none() {
                    ctx.meta.create_shard_view(self.new_shard).await?;
                }
                self.step = Step::CommitOld;
                Ok(StepOutcome::Continue)
            }
            Step::CommitOld => {
                let view = ctx
                    .meta
                    .shard_view(self.old_shard)
                    .ok_or(MetaError::ShardNotFound(self.old_shard))?;
                let remaining: Vec<TableId> = view
                    .table_ids
                    .iter()
                    .filter(|t| !self.moving.contains(t))
                    .copied()
                    .collect();
                if remaining.len() != view.table_ids.len() {
                    ctx.meta
                        .replace_shard_view(self.old_shard, remaining)
                        .await?;
                }
                self.step = Step::CommitNew;
                Ok(StepOutcome::Continue)
            }
            Step::CommitNew => {
                let view = ctx
                    .meta
                    .shard_view(self.new_shard)
                    .ok_or(MetaError::ShardNotFound(self.new_shard))?;
                if view.table_ids != self.moving {
                    ctx.meta
                        .replace_shard_view(self.new_shard, self.moving.clone())
                        .await?;
                }
                self.step = Step::CommitClusterView;
                Ok(StepOutcome::Continue)
            }
            Step::CommitClusterView => {
                let snapshot = ctx.meta.snapshot();
                let already_placed = snapshot
                    .topology
                    .leader_of(self.new_shard)
                    .is_some();
                if !already_placed {
                    let mut shard_nodes = snapshot.topology.cluster_view.shard_nodes.clone();
                    shard_nodes.push(ShardNode {
                        shard_id: self.new_shard,
                        role: tessera_common::ShardRole::Leader,
                        node_name: self.target_node.clone(),
                    });
                    ctx.meta
                        .apply_cluster_view(snapshot.state(), shard_nodes)
                        .await?;
                }
                self.step = Step::DispatchOpen;
                Ok(StepOutcome::Continue)
            }
            Step::DispatchOpen => {
                let shard = current_shard_info(&ctx.meta, self.new_shard)?;
                ctx.dispatch
                    .open_shard(&self.target_node, OpenShardRequest { shard })
                    .await?;
                info!(
                    old = %self.old_shard,
                    new = %self.new_shard,
                    tables = self.moving.len(),
                    node = %self.target_node,
                    "shard split"
                );
                Ok(StepOutcome::Finished)
            }
        }
    }
}
