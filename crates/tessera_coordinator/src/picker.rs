//! Placement strategies: where new tables land (`ShardPicker`) and where
//! orphaned shards go (`NodePicker`), plus operator-pinned affinity rules.
//!
//! Both pickers are deterministic so a decision recomputed after a crash
//! or on another member lands on the same target.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tessera_common::{MetaError, MetaResult, ShardId};
use tessera_meta::ClusterSnapshot;

// ── Shard picker ────────────────────────────────────────────────────────────

/// Chooses target shards for new tables.
pub trait ShardPicker: Send + Sync {
    /// Pick `n` shards, repeating when the cluster has fewer than `n`.
    fn pick(&self, snapshot: &ClusterSnapshot, n: usize) -> MetaResult<Vec<ShardId>>;
}

/// Default picker: least tables first, lowest shard ID on ties, so the
/// choice is reproducible across members.
#[derive(Default)]
pub struct LeastTableShardPicker;

impl ShardPicker for LeastTableShardPicker {
    fn pick(&self, snapshot: &ClusterSnapshot, n: usize) -> MetaResult<Vec<ShardId>> {
        if snapshot.topology.shard_views.is_empty() {
            return Err(MetaError::InvalidTopology {
                cluster: snapshot.cluster.id,
                reason: "no shards to pick from".into(),
            });
        }
        // (table count, shard id) ascending; BTreeMap iteration already
        // yields ids in order, the sort is stable.
        let mut order: Vec<(usize, ShardId)> = snapshot
            .topology
            .shard_views
            .values()
            .map(|v| (v.table_ids.len(), v.shard_id))
            .collect();
        order.sort();

        let mut picked = Vec::with_capacity(n);
        let mut counts: HashMap<ShardId, usize> =
            order.iter().map(|(c, id)| (*id, *c)).collect();
        for _ in 0..n {
            let (_, shard_id) = order
                .iter()
                .map(|(_, id)| (counts[id], *id))
                .min()
                .expect("non-empty");
            *counts.get_mut(&shard_id).expect("picked known shard") += 1;
            picked.push(shard_id);
        }
        Ok(picked)
    }
}

// ── Node picker ─────────────────────────────────────────────────────────────

/// Chooses the node a shard should live on, out of candidate node names.
pub trait NodePicker: Send + Sync {
    fn pick(&self, shard_id: ShardId, candidates: &[String]) -> Option<String>;
}

/// Rendezvous-style picker: each (shard, node) pair hashes to a weight and
/// the highest weight wins. Uniform across nodes, stable under membership
/// changes (only shards on a removed node move).
#[derive(Default)]
pub struct ConsistentUniformHashNodePicker;

fn weight(shard_id: ShardId, node: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    shard_id.0.hash(&mut hasher);
    node.hash(&mut hasher);
    hasher.finish()
}

impl NodePicker for ConsistentUniformHashNodePicker {
    fn pick(&self, shard_id: ShardId, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .max_by_key(|node| (weight(shard_id, node), std::cmp::Reverse(node.as_str())))
            .cloned()
    }
}

// ── Affinity rules ──────────────────────────────────────────────────────────

/// Operator-pinned placement preference for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAffinityRule {
    pub shard_id: ShardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_node: Option<String>,
    #[serde(default)]
    pub forbidden_nodes: Vec<String>,
}

/// In-memory store of affinity rules, managed via the admin API and
/// consulted by the scheduler before the hash picker.
#[derive(Default)]
pub struct ShardAffinityStore {
    rules: RwLock<HashMap<ShardId, ShardAffinityRule>>,
}

impl ShardAffinityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, rule: ShardAffinityRule) {
        self.rules.write().insert(rule.shard_id, rule);
    }

    pub fn remove(&self, shard_id: ShardId) -> bool {
        self.rules.write().remove(&shard_id).is_some()
    }

    pub fn list(&self) -> Vec<ShardAffinityRule> {
        let mut out: Vec<ShardAffinityRule> = self.rules.read().values().cloned().collect();
        out.sort_by_key(|r| r.shard_id);
        out
    }

    /// Apply affinity to a candidate set: the preferred node wins when it
    /// is a live candidate, forbidden nodes are filtered out.
    pub fn bias<'a>(&self, shard_id: ShardId, candidates: &'a [String]) -> BiasedCandidates<'a> {
        let rules = self.rules.read();
        match rules.get(&shard_id) {
            Some(rule) => {
                if let Some(preferred) = &rule.preferred_node {
                    if candidates.contains(preferred) {
                        return BiasedCandidates::Pinned(preferred.clone());
                    }
                }
                BiasedCandidates::Filtered(
                    candidates
                        .iter()
                        .filter(|c| !rule.forbidden_nodes.contains(c))
                        .cloned()
                        .collect(),
                )
            }
            None => BiasedCandidates::Unbiased(candidates),
        }
    }
}

/// Result of applying an affinity rule to a candidate set.
pub enum BiasedCandidates<'a> {
    Pinned(String),
    Filtered(Vec<String>),
    Unbiased(&'a [String]),
}

impl BiasedCandidates<'_> {
    /// Resolve to a final choice with the given picker.
    pub fn pick(&self, picker: &dyn NodePicker, shard_id: ShardId) -> Option<String> {
        match self {
            BiasedCandidates::Pinned(node) => Some(node.clone()),
            BiasedCandidates::Filtered(candidates) => picker.pick(shard_id, candidates),
            BiasedCandidates::Unbiased(candidates) => picker.pick(shard_id, candidates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tessera_common::{ClusterId, ClusterState, TableId, TopologyType};
    use tessera_storage::{ClusterRecord, ClusterViewRecord, ShardViewRecord};

    fn snapshot(tables_per_shard: &[(u32, usize)]) -> ClusterSnapshot {
        let shard_views: BTreeMap<ShardId, ShardViewRecord> = tables_per_shard
            .iter()
            .map(|(shard, count)| {
                (
                    ShardId(*shard),
                    ShardViewRecord {
                        shard_id: ShardId(*shard),
                        version: 1,
                        table_ids: (0..*count).map(|i| TableId(*shard as u64 * 100 + i as u64)).collect(),
                        created_at: 0,
                    },
                )
            })
            .collect();
        ClusterSnapshot {
            cluster: ClusterRecord {
                id: ClusterId(1),
                name: "c".into(),
                min_node_count: 1,
                shard_total: tables_per_shard.len() as u32,
                topology_type: TopologyType::Static,
                procedure_executing_batch_size: 4,
                created_at: 0,
                modified_at: 0,
            },
            topology: tessera_meta::Topology {
                cluster_view: ClusterViewRecord {
                    cluster_id: ClusterId(1),
                    version: 1,
                    state: ClusterState::Stable,
                    shard_nodes: vec![],
                    created_at: 0,
                },
                shard_views,
            },
            nodes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_least_table_picks_emptiest() {
        let picker = LeastTableShardPicker;
        let snap = snapshot(&[(0, 3), (1, 1), (2, 2)]);
        assert_eq!(picker.pick(&snap, 1).unwrap(), vec![ShardId(1)]);
    }

    #[test]
    fn test_least_table_tie_breaks_on_lowest_id() {
        let picker = LeastTableShardPicker;
        let snap = snapshot(&[(2, 1), (0, 1), (1, 1)]);
        assert_eq!(picker.pick(&snap, 1).unwrap(), vec![ShardId(0)]);
    }

    #[test]
    fn test_least_table_spreads_multi_pick() {
        let picker = LeastTableShardPicker;
        let snap = snapshot(&[(0, 0), (1, 0), (2, 0)]);
        // Each pick counts toward the next decision, so four picks cycle.
        assert_eq!(
            picker.pick(&snap, 4).unwrap(),
            vec![ShardId(0), ShardId(1), ShardId(2), ShardId(0)]
        );
    }

    #[test]
    fn test_pick_from_empty_topology_fails() {
        let picker = LeastTableShardPicker;
        let snap = snapshot(&[]);
        assert!(picker.pick(&snap, 1).is_err());
    }

    #[test]
    fn test_hash_picker_is_deterministic() {
        let picker = ConsistentUniformHashNodePicker;
        let nodes: Vec<String> = (0..5).map(|i| format!("node-{i}")).collect();
        let a = picker.pick(ShardId(7), &nodes);
        let b = picker.pick(ShardId(7), &nodes);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn test_hash_picker_roughly_uniform() {
        let picker = ConsistentUniformHashNodePicker;
        let nodes: Vec<String> = (0..4).map(|i| format!("node-{i}")).collect();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for shard in 0..400u32 {
            let node = picker.pick(ShardId(shard), &nodes).unwrap();
            *counts.entry(node).or_default() += 1;
        }
        for node in &nodes {
            let count = counts.get(node).copied().unwrap_or(0);
            assert!(count > 40, "{node} got only {count} of 400 shards");
        }
    }

    #[test]
    fn test_hash_picker_stability_under_node_loss() {
        let picker = ConsistentUniformHashNodePicker;
        let all: Vec<String> = (0..4).map(|i| format!("node-{i}")).collect();
        let removed = "node-3".to_string();
        let remaining: Vec<String> = all.iter().filter(|n| **n != removed).cloned().collect();
        for shard in 0..100u32 {
            let before = picker.pick(ShardId(shard), &all).unwrap();
            let after = picker.pick(ShardId(shard), &remaining).unwrap();
            if before != removed {
                assert_eq!(before, after, "shard {shard} moved unnecessarily");
            }
        }
    }

    #[test]
    fn test_affinity_preferred_node_wins() {
        let store = ShardAffinityStore::new();
        store.upsert(ShardAffinityRule {
            shard_id: ShardId(1),
            preferred_node: Some("node-2".into()),
            forbidden_nodes: vec![],
        });
        let candidates: Vec<String> = (0..3).map(|i| format!("node-{i}")).collect();
        let picked = store
            .bias(ShardId(1), &candidates)
            .pick(&ConsistentUniformHashNodePicker, ShardId(1));
        assert_eq!(picked.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_affinity_forbidden_nodes_filtered() {
        let store = ShardAffinityStore::new();
        store.upsert(ShardAffinityRule {
            shard_id: ShardId(1),
            preferred_node: None,
            forbidden_nodes: vec!["node-0".into(), "node-1".into()],
        });
        let candidates: Vec<String> = (0..3).map(|i| format!("node-{i}")).collect();
        let picked = store
            .bias(ShardId(1), &candidates)
            .pick(&ConsistentUniformHashNodePicker, ShardId(1));
        assert_eq!(picked.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_affinity_preferred_must_be_candidate() {
        let store = ShardAffinityStore::new();
        store.upsert(ShardAffinityRule {
            shard_id: ShardId(1),
            preferred_node: Some("gone".into()),
            forbidden_nodes: vec![],
        });
        let candidates = vec!["node-0".to_string()];
        let picked = store
            .bias(ShardId(1), &candidates)
            .pick(&ConsistentUniformHashNodePicker, ShardId(1));
        assert_eq!(picked.as_deref(), Some("node-0"));
    }

    #[test]
    fn test_affinity_store_crud() {
        let store = ShardAffinityStore::new();
        store.upsert(ShardAffinityRule {
            shard_id: ShardId(2),
            preferred_node: None,
            forbidden_nodes: vec![],
        });
        assert_eq!(store.list().len(), 1);
        assert!(store.remove(ShardId(2)));
        assert!(!store.remove(ShardId(2)));
        assert!(store.list().is_empty());
    }
}
