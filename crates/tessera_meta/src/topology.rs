//! Topology value types: the versioned placement of shards on nodes and
//! the per-shard table sets, plus the snapshot handed to readers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tessera_common::{
    ClusterState, MetaError, MetaResult, ShardId, ShardRole, ShardStatus,
};
use tessera_storage::{ClusterRecord, ClusterViewRecord, NodeRecord, ShardViewRecord};

/// What one data node knows about one shard; flows over heartbeats and in
/// every dispatch request so the node can reject stale updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub role: ShardRole,
    pub version: u64,
    pub status: ShardStatus,
}

/// The committed placement state of a cluster: the cluster view plus every
/// shard view, keyed by shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub cluster_view: ClusterViewRecord,
    pub shard_views: BTreeMap<ShardId, ShardViewRecord>,
}

impl Topology {
    /// The leader entry of a shard, if placed.
    pub fn leader_of(&self, shard_id: ShardId) -> Option<&tessera_storage::ShardNode> {
        self.cluster_view
            .shard_nodes
            .iter()
            .find(|sn| sn.shard_id == shard_id && sn.role == ShardRole::Leader)
    }

    /// All shard IDs assigned to a node (any role).
    pub fn shards_on_node(&self, node_name: &str) -> Vec<ShardId> {
        self.cluster_view
            .shard_nodes
            .iter()
            .filter(|sn| sn.node_name == node_name)
            .map(|sn| sn.shard_id)
            .collect()
    }

    /// Verify the structural invariants of a committed topology:
    /// a table lives on at most one shard, every referenced node is known,
    /// and each placed shard has exactly one leader.
    pub fn validate(&self, nodes: &BTreeMap<String, NodeRecord>) -> MetaResult<()> {
        let mut seen_tables = std::collections::HashMap::new();
        for view in self.shard_views.values() {
            for table_id in &view.table_ids {
                if let Some(prev) = seen_tables.insert(*table_id, view.shard_id) {
                    return Err(MetaError::InvalidTopology {
                        cluster: self.cluster_view.cluster_id,
                        reason: format!(
                            "{table_id} appears on both {prev} and {}",
                            view.shard_id
                        ),
                    });
                }
            }
        }

        let mut leaders = std::collections::HashMap::new();
        for sn in &self.cluster_view.shard_nodes {
            if !nodes.contains_key(&sn.node_name) {
                return Err(MetaError::InvalidTopology {
                    cluster: self.cluster_view.cluster_id,
                    reason: format!("{} references unknown node {}", sn.shard_id, sn.node_name),
                });
            }
            if sn.role == ShardRole::Leader {
                let count = leaders.entry(sn.shard_id).or_insert(0u32);
                *count += 1;
                if *count > 1 {
                    return Err(MetaError::InvalidTopology {
                        cluster: self.cluster_view.cluster_id,
                        reason: format!("{} has more than one leader", sn.shard_id),
                    });
                }
            }
        }
        for sn in &self.cluster_view.shard_nodes {
            if !leaders.contains_key(&sn.shard_id) {
                return Err(MetaError::InvalidTopology {
                    cluster: self.cluster_view.cluster_id,
                    reason: format!("{} has followers but no leader", sn.shard_id),
                });
            }
        }
        Ok(())
    }
}

/// A value-copied, immutable view of one cluster taken under the reader
/// lock. Long-running consumers (scheduler ticks, procedures) work from a
/// snapshot so they never block writers.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub cluster: ClusterRecord,
    pub topology: Topology,
    pub nodes: BTreeMap<String, NodeRecord>,
}

impl ClusterSnapshot {
    pub fn state(&self) -> ClusterState {
        self.topology.cluster_view.state
    }

    /// Nodes whose last heartbeat is within `timeout_ms` of `now_ms`.
    pub fn alive_nodes(&self, now_ms: u64, timeout_ms: u64) -> Vec<&NodeRecord> {
        self.nodes
            .values()
            .filter(|n| now_ms.saturating_sub(n.last_touch_time) < timeout_ms)
            .collect()
    }
}
