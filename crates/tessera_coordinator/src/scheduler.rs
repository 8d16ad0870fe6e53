//! Periodic reconciliation: compares the desired topology with observed
//! node state and submits procedures to converge.
//!
//! Runs on the leader only — the server starts the runner on election and
//! stops it on lease loss. Per tick, bounded by
//! `max_procedures_per_tick`:
//!
//! - **static** topology: bootstrap scatter once `min_node_count` nodes
//!   are up, and reopen shards that a live owner stopped advertising.
//! - **dynamic** topology: the static duties plus reassignment of shards
//!   whose owner has been silent beyond the liveness window, via the
//!   consistent-hash node picker biased by affinity rules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tessera_common::config::{HeartbeatConfig, SchedulerConfig};
use tessera_common::{now_ms, ClusterState, MetaResult, ShutdownSignal, TopologyType};
use tessera_meta::ClusterMetadata;

use crate::picker::{ConsistentUniformHashNodePicker, NodePicker, ShardAffinityStore};
use crate::procedure::{
    OpenShardProcedure, Procedure, ProcedureManager, ScatterProcedure, TransferLeaderProcedure,
};

pub struct Scheduler {
    meta: Arc<ClusterMetadata>,
    manager: Arc<ProcedureManager>,
    config: SchedulerConfig,
    heartbeat: HeartbeatConfig,
    enabled: AtomicBool,
    node_picker: Box<dyn NodePicker>,
    affinity: ShardAffinityStore,
}

impl Scheduler {
    pub fn new(
        meta: Arc<ClusterMetadata>,
        manager: Arc<ProcedureManager>,
        config: SchedulerConfig,
        heartbeat: HeartbeatConfig,
    ) -> Arc<Self> {
        let enabled = AtomicBool::new(config.enable_schedule);
        Arc::new(Self {
            meta,
            manager,
            config,
            heartbeat,
            enabled,
            node_picker: Box::new(ConsistentUniformHashNodePicker),
            affinity: ShardAffinityStore::new(),
        })
    }

    pub fn affinity(&self) -> &ShardAffinityStore {
        &self.affinity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Hot toggle from the admin API.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(cluster = %self.meta.cluster_id(), enabled, "schedule toggled");
    }

    /// Run the tick loop until shutdown. The caller owns leader gating.
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        tokio::spawn(async move {
            loop {
                if shutdown.wait_timeout(interval).await {
                    return;
                }
                if !self.is_enabled() {
                    continue;
                }
                if let Err(e) = self.tick().await {
                    warn!(cluster = %self.meta.cluster_id(), error = %e, "scheduler tick failed");
                }
            }
        })
    }

    /// One reconciliation pass. Public for deterministic tests.
    pub async fn tick(&self) -> MetaResult<usize> {
        let start = std::time::Instant::now();
        self.meta
            .expire_nodes(self.heartbeat.liveness_timeout_ms)
            .await?;
        let snapshot = self.meta.snapshot();
        let mut quota = self.config.max_procedures_per_tick;
        let mut submitted = 0usize;

        // Bootstrap: scatter once the node quorum arrives.
        if quota > 0 && snapshot.state() == ClusterState::Empty {
            let alive: Vec<String> = snapshot
                .alive_nodes(now_ms(), self.heartbeat.liveness_timeout_ms)
                .iter()
                .map(|n| n.name.clone())
                .collect();
            if (alive.len() as u32) >= snapshot.cluster.min_node_count {
                let scatter = ScatterProcedure::new(&snapshot, alive)?;
                self.manager
                    .submit(Procedure::Scatter(scatter))
                    .await?;
                quota -= 1;
                submitted += 1;
            }
        }

        if snapshot.state() == ClusterState::Stable {
            submitted += self.reopen_missing_shards(&snapshot, &mut quota).await?;
            if snapshot.cluster.topology_type == TopologyType::Dynamic {
                submitted += self.reassign_orphans(&snapshot, &mut quota).await?;
            }
        }

        metrics::histogram!("tessera_scheduler_tick_ms")
            .record(start.elapsed().as_millis() as f64);
        if submitted > 0 {
            debug!(cluster = %self.meta.cluster_id(), submitted, "scheduler tick");
        }
        Ok(submitted)
    }

    /// A live owner that no longer advertises one of its shards gets it
    /// re-sent (the node restarted and lost in-memory shard state).
    async fn reopen_missing_shards(
        &self,
        snapshot: &tessera_meta::ClusterSnapshot,
        quota: &mut usize,
    ) -> MetaResult<usize> {
        let now = now_ms();
        let mut submitted = 0;
        for sn in &snapshot.topology.cluster_view.shard_nodes {
            if *quota == 0 {
                break;
            }
            let Some(node) = snapshot.nodes.get(&sn.node_name) else {
                continue;
            };
            let alive = now.saturating_sub(node.last_touch_time) < self.heartbeat.liveness_timeout_ms;
            if !alive {
                continue;
            }
            let Some(reported) = self.meta.node_shard_infos(&sn.node_name) else {
                continue;
            };
            if reported.iter().any(|info| info.shard_id == sn.shard_id) {
                continue;
            }
            match OpenShardProcedure::new(snapshot, sn.shard_id) {
                Ok(open) => {
                    info!(shard = %sn.shard_id, node = %sn.node_name, "scheduling reopen");
                    self.manager.submit(Procedure::Open(open)).await?;
                    *quota -= 1;
                    submitted += 1;
                }
                Err(e) => debug!(shard = %sn.shard_id, error = %e, "skip reopen"),
            }
        }
        Ok(submitted)
    }

    /// Shards owned by an expired node move to a picker-chosen live node.
    async fn reassign_orphans(
        &self,
        snapshot: &tessera_meta::ClusterSnapshot,
        quota: &mut usize,
    ) -> MetaResult<usize> {
        let now = now_ms();
        let alive: Vec<String> = snapshot
            .alive_nodes(now, self.heartbeat.liveness_timeout_ms)
            .iter()
            .map(|n| n.name.clone())
            .collect();
        if alive.is_empty() {
            return Ok(0);
        }

        let mut submitted = 0;
        for sn in &snapshot.topology.cluster_view.shard_nodes {
            if *quota == 0 {
                break;
            }
            if sn.role != tessera_common::ShardRole::Leader {
                continue;
            }
            let owner_alive = snapshot
                .nodes
                .get(&sn.node_name)
                .map(|n| now.saturating_sub(n.last_touch_time) < self.heartbeat.liveness_timeout_ms)
                .unwrap_or(false);
            if owner_alive {
                continue;
            }

            let candidates: Vec<String> = alive
                .iter()
                .filter(|n| **n != sn.node_name)
                .cloned()
                .collect();
            let Some(target) = self
                .affinity
                .bias(sn.shard_id, &candidates)
                .pick(self.node_picker.as_ref(), sn.shard_id)
            else {
                continue;
            };
            match TransferLeaderProcedure::new(snapshot, sn.shard_id, target.clone(), false) {
                Ok(transfer) => {
                    info!(
                        shard = %sn.shard_id,
                        from = %sn.node_name,
                        to = %target,
                        "scheduling failover transfer"
                    );
                    self.manager
                        .submit(Procedure::TransferLeader(transfer))
                        .await?;
                    *quota -= 1;
                    submitted += 1;
                }
                Err(e) => debug!(shard = %sn.shard_id, error = %e, "skip reassign"),
            }
        }
        Ok(submitted)
    }
}
