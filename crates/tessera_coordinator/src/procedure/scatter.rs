//! Scatter: the bootstrap assignment of shards to nodes.
//!
//! Fires only from `ClusterState::Empty` once at least `min_node_count`
//! nodes are registered. Shards are dealt round-robin: every node gets
//! `shard_total / node_count`, and the first `shard_total % node_count`
//! nodes (in name order) one extra. The cluster passes through `Prepare`
//! while shards open and commits `Stable` when all are open.

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{ClusterState, MetaError, MetaResult, ShardId, ShardRole};
use tessera_meta::ClusterSnapshot;
use tessera_storage::ShardNode;

use crate::dispatch::OpenShardRequest;
use crate::procedure::{current_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    CommitPrepare,
    DispatchOpens,
    CommitStable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatterProcedure {
    /// shard → node, decided at construction.
    pub assignment: Vec<(ShardId, String)>,
    /// Per-shard open progress; resume skips completed targets.
    pub opened: Vec<bool>,
    step: Step,
}

/// Deal `shards` across `nodes` (sorted by name): node i takes
/// `total/count` shards plus one extra for the first `total%count` nodes.
pub fn alloc_node_shards(shards: &[ShardId], nodes: &[String]) -> Vec<(ShardId, String)> {
    let total = shards.len();
    let count = nodes.len();
    if count == 0 {
        return vec![];
    }
    let base = total / count;
    let extra = total % count;

    let mut out = Vec::with_capacity(total);
    let mut next = 0usize;
    for (i, node) in nodes.iter().enumerate() {
        let quota = base + usize::from(i < extra);
        for _ in 0..quota {
            out.push((shards[next], node.clone()));
            next += 1;
        }
    }
    out
}

impl ScatterProcedure {
    pub fn new(snapshot: &ClusterSnapshot, alive_nodes: Vec<String>) -> MetaResult<Self> {
        if snapshot.state() != ClusterState::Empty {
            return Err(MetaError::InvalidTopology {
                cluster: snapshot.cluster.id,
                reason: format!("scatter requires an empty cluster, state is {:?}", snapshot.state()),
            });
        }
        if (alive_nodes.len() as u32) < snapshot.cluster.min_node_count {
            return Err(MetaError::InvalidTopology {
                cluster: snapshot.cluster.id,
                reason: format!(
                    "{} nodes alive, min_node_count is {}",
                    alive_nodes.len(),
                    snapshot.cluster.min_node_count
                ),
            });
        }
        let mut nodes = alive_nodes;
        nodes.sort();
        let shards: Vec<ShardId> = snapshot.topology.shard_views.keys().copied().collect();
        let assignment = alloc_node_shards(&shards, &nodes);
        let opened = vec![false; assignment.len()];
        Ok(Self {
            assignment,
            opened,
            step: Step::CommitPrepare,
        })
    }

    fn shard_nodes(&self) -> Vec<ShardNode> {
        self.assignment
            .iter()
            .map(|(shard_id, node_name)| ShardNode {
                shard_id: *shard_id,
                role: ShardRole::Leader,
                node_name: node_name.clone(),
            })
            .collect()
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self.step {
            Step::CommitPrepare => {
                match ctx.meta.snapshot().state() {
                    ClusterState::Empty => {
                        ctx.meta
                            .apply_cluster_view(ClusterState::Prepare, self.shard_nodes())
                            .await?;
                    }
                    // Our own commit from before a crash.
                    ClusterState::Prepare => {}
                    ClusterState::Stable => {
                        return Err(MetaError::StaleSnapshot(
                            "cluster already scattered".into(),
                        ));
                    }
                }
                self.step = Step::DispatchOpens;
                Ok(StepOutcome::Continue)
            }
            Step::DispatchOpens => {
                for i in 0..self.assignment.len() {
                    if self.opened[i] {
                        continue;
                    }
                    let (shard_id, node_name) = self.assignment[i].clone();
                    let shard = current_shard_info(&ctx.meta, shard_id)?;
                    ctx.dispatch
                        .open_shard(&node_name, OpenShardRequest { shard })
                        .await?;
                    self.opened[i] = true;
                }
                self.step = Step::CommitStable;
                Ok(StepOutcome::Continue)
            }
            Step::CommitStable => {
                if ctx.meta.snapshot().state() != ClusterState::Stable {
                    ctx.meta
                        .apply_cluster_view(ClusterState::Stable, self.shard_nodes())
                        .await?;
                }
                info!(shards = self.assignment.len(), "cluster scattered to stable");
                Ok(StepOutcome::Finished)
            }
        }
    }
}
