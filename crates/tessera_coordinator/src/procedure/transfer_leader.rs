//! TransferLeader: close the shard on the old leader, CAS the cluster view
//! to the new leader, open the shard there. The close is skipped when the
//! old leader is known dead — a failed node cannot be asked to close.

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{MetaError, MetaResult, ShardId, ShardRole};
use tessera_meta::ClusterSnapshot;
use tessera_storage::ShardNode;

use crate::dispatch::{CloseShardRequest, OpenShardRequest};
use crate::procedure::{current_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    CloseOld,
    CommitView,
    OpenNew,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeaderProcedure {
    pub shard_id: ShardId,
    /// Leader at construction time; `None` for a never-placed shard.
    pub old_leader: Option<String>,
    pub new_leader: String,
    /// False when the old leader's liveness already expired; the close
    /// dispatch is skipped then.
    pub old_leader_reachable: bool,
    step: Step,
}

impl TransferLeaderProcedure {
    pub fn new(
        snapshot: &ClusterSnapshot,
        shard_id: ShardId,
        new_leader: impl Into<String>,
        old_leader_reachable: bool,
    ) -> MetaResult<Self> {
        let new_leader = new_leader.into();
        if !snapshot.topology.shard_views.contains_key(&shard_id) {
            return Err(MetaError::ShardNotFound(shard_id));
        }
        if !snapshot.nodes.contains_key(&new_leader) {
            return Err(MetaError::NodeNotFound(new_leader));
        }
        let old_leader = snapshot
            .topology
            .leader_of(shard_id)
            .map(|sn| sn.node_name.clone());
        if old_leader.as_deref() == Some(new_leader.as_str()) {
            return Err(MetaError::InvalidArgument(format!(
                "{shard_id} already led by {new_leader}"
            )));
        }
        Ok(Self {
            shard_id,
            old_leader,
            new_leader,
            old_leader_reachable,
            step: Step::CloseOld,
        })
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self.step {
            Step::CloseOld => {
                match (&self.old_leader, self.old_leader_reachable) {
                    (Some(old), true) => {
                        ctx.dispatch
                            .close_shard(
                                old,
                                CloseShardRequest {
                                    shard_id: self.shard_id,
                                },
                            )
                            .await?;
                    }
                    _ => {}
                }
                self.step = Step::CommitView;
                Ok(StepOutcome::Continue)
            }
            Step::CommitView => {
                let snapshot = ctx.meta.snapshot();
                let current_leader = snapshot
                    .topology
                    .leader_of(self.shard_id)
                    .map(|sn| sn.node_name.clone());
                if current_leader.as_deref() == Some(self.new_leader.as_str()) {
                    // Our CAS landed before a crash; nothing to commit.
                    self.step = Step::OpenNew;
                    return Ok(StepOutcome::Continue);
                }
                if current_leader != self.old_leader {
                    return Err(MetaError::StaleSnapshot(format!(
                        "{} leader moved to {current_leader:?} behind our back",
                        self.shard_id
                    )));
                }

                let mut shard_nodes: Vec<ShardNode> = snapshot
                    .topology
                    .cluster_view
                    .shard_nodes
                    .iter()
                    .filter(|sn| {
                        !(sn.shard_id == self.shard_id
                            && (sn.role == ShardRole::Leader
                                || sn.node_name == self.new_leader))
                    })
                    .cloned()
                    .collect();
                shard_nodes.push(ShardNode {
                    shard_id: self.shard_id,
                    role: ShardRole::Leader,
                    node_name: self.new_leader.clone(),
                });
                ctx.meta
                    .apply_cluster_view(snapshot.state(), shard_nodes)
                    .await?;
                self.step = Step::OpenNew;
                Ok(StepOutcome::Continue)
            }
            Step::OpenNew => {
                let shard = current_shard_info(&ctx.meta, self.shard_id)?;
                ctx.dispatch
                    .open_shard(&self.new_leader, OpenShardRequest { shard })
                    .await?;
                info!(
                    shard = %self.shard_id,
                    from = ?self.old_leader,
                    to = %self.new_leader,
                    "leadership transferred"
                );
                Ok(StepOutcome::Finished)
            }
        }
    }
}
