//! Typed record storage on top of [`KvBackend`].
//!
//! Records are serialized as JSON: the Rust types are the source of truth
//! and the KV stores an opaque envelope. Every record carries
//! `created_at`/`modified_at` in milliseconds since the epoch.
//!
//! Versioned records (`ShardViewRecord`, `ClusterViewRecord`) are mutated
//! with compare-and-swap: the caller states the version it read, the store
//! verifies it against the current record and guards the write on the
//! key's KV revision. A successful CAS is the only way those versions move.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tessera_common::{
    now_ms, ClusterId, ClusterState, MetaError, MetaResult, NodeState, ProcedureId, SchemaId,
    ShardId, ShardRole, TableId, TopologyType,
};

use crate::keys;
use crate::kv::{self, KvBackend, TxnGuard, TxnOp, MAX_OPS_PER_TXN};

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub name: String,
    pub min_node_count: u32,
    pub shard_total: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
    pub created_at: u64,
    pub modified_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub id: SchemaId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub created_at: u64,
}

/// Presence on a table marks it as a partitioned root table; its
/// sub-tables are regular tables named `<root>_<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_num: u32,
    pub partition_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_info: Option<PartitionInfo>,
    pub created_at: u64,
}

impl TableRecord {
    pub fn is_partitioned(&self) -> bool {
        self.partition_info.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardViewRecord {
    pub shard_id: ShardId,
    pub version: u64,
    pub table_ids: Vec<TableId>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardNode {
    pub shard_id: ShardId,
    pub role: ShardRole,
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterViewRecord {
    pub cluster_id: ClusterId,
    pub version: u64,
    pub state: ClusterState,
    pub shard_nodes: Vec<ShardNode>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub lease: u32,
    pub zone: String,
    pub node_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub stats: NodeStats,
    pub last_touch_time: u64,
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureState {
    Init,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl ProcedureState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcedureState::Finished | ProcedureState::Failed | ProcedureState::Cancelled
        )
    }
}

/// Durable state of a procedure; persisted before every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: ProcedureId,
    pub kind: String,
    pub state: ProcedureState,
    pub cluster_id: ClusterId,
    /// Kind-specific resumable state, opaque to the store.
    pub raw_state: serde_json::Value,
    pub created_at: u64,
    pub modified_at: u64,
}

// ── Storage ─────────────────────────────────────────────────────────────────

fn encode<T: Serialize>(record: &T) -> MetaResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| MetaError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MetaResult<T> {
    serde_json::from_slice(bytes).map_err(|e| MetaError::Codec(e.to_string()))
}

/// Typed, namespaced access to everything the service persists.
#[derive(Clone)]
pub struct MetaStorage {
    kv: Arc<dyn KvBackend>,
    root: String,
}

impl MetaStorage {
    pub fn new(kv: Arc<dyn KvBackend>, root: impl Into<String>) -> Self {
        Self {
            kv,
            root: root.into(),
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    // ── Clusters ───────────────────────────────────────────────────────────

    pub async fn create_cluster(&self, record: &ClusterRecord) -> MetaResult<()> {
        let key = keys::cluster_key(&self.root, record.id);
        self.kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: 0,
                }],
                vec![TxnOp::Put {
                    key,
                    value: encode(record)?,
                }],
            )
            .await
            .map_err(|e| match e {
                MetaError::VersionConflict { .. } => {
                    MetaError::ClusterAlreadyExists(record.name.clone())
                }
                other => other,
            })
    }

    pub async fn update_cluster(&self, record: &ClusterRecord) -> MetaResult<()> {
        let mut record = record.clone();
        record.modified_at = now_ms();
        let key = keys::cluster_key(&self.root, record.id);
        self.kv.put(&key, encode(&record)?).await?;
        Ok(())
    }

    pub async fn list_clusters(&self) -> MetaResult<Vec<ClusterRecord>> {
        let prefix = keys::cluster_prefix(&self.root);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            // The prefix also covers nested schema/shard_view/node keys;
            // cluster rows are exactly one path segment below the prefix.
            if kv.key[prefix.len()..].contains('/') {
                continue;
            }
            out.push(decode::<ClusterRecord>(&kv.value)?);
        }
        Ok(out)
    }

    // ── Schemas ────────────────────────────────────────────────────────────

    pub async fn create_schema(&self, record: &SchemaRecord) -> MetaResult<()> {
        let key = keys::schema_key(&self.root, record.cluster_id, record.id);
        self.kv.put(&key, encode(record)?).await?;
        Ok(())
    }

    pub async fn list_schemas(&self, cluster: ClusterId) -> MetaResult<Vec<SchemaRecord>> {
        let prefix = keys::schema_prefix(&self.root, cluster);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            if kv.key[prefix.len()..].contains('/') {
                continue;
            }
            out.push(decode::<SchemaRecord>(&kv.value)?);
        }
        Ok(out)
    }

    // ── Tables ─────────────────────────────────────────────────────────────

    /// Create a table row; fails `AlreadyExists` when a row with this name
    /// is already present under the schema.
    pub async fn create_table(&self, cluster: ClusterId, record: &TableRecord) -> MetaResult<()> {
        let key = keys::table_key(&self.root, cluster, record.schema_id, &record.name);
        self.kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: 0,
                }],
                vec![TxnOp::Put {
                    key,
                    value: encode(record)?,
                }],
            )
            .await
            .map_err(|e| match e {
                MetaError::VersionConflict { .. } => {
                    MetaError::table_already_exists(record.id, &record.name)
                }
                other => other,
            })
    }

    pub async fn get_table(
        &self,
        cluster: ClusterId,
        schema: SchemaId,
        table_name: &str,
    ) -> MetaResult<Option<TableRecord>> {
        let key = keys::table_key(&self.root, cluster, schema, table_name);
        match self.kv.get(&key).await? {
            Some(kv) => Ok(Some(decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    pub async fn list_tables(
        &self,
        cluster: ClusterId,
        schema: SchemaId,
    ) -> MetaResult<Vec<TableRecord>> {
        let prefix = keys::table_prefix(&self.root, cluster, schema);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            out.push(decode::<TableRecord>(&kv.value)?);
        }
        Ok(out)
    }

    pub async fn delete_table(
        &self,
        cluster: ClusterId,
        schema: SchemaId,
        table_name: &str,
    ) -> MetaResult<()> {
        let key = keys::table_key(&self.root, cluster, schema, table_name);
        self.kv.delete(&key).await?;
        Ok(())
    }

    // ── Shard views ────────────────────────────────────────────────────────

    /// Persist the initial shard views of a cluster. Batches are split so
    /// no transaction exceeds the ops bound.
    pub async fn create_shard_views(
        &self,
        cluster: ClusterId,
        views: &[ShardViewRecord],
    ) -> MetaResult<()> {
        for chunk in views.chunks(MAX_OPS_PER_TXN) {
            let mut guards = Vec::with_capacity(chunk.len());
            let mut ops = Vec::with_capacity(chunk.len());
            for view in chunk {
                let key = keys::shard_view_key(&self.root, cluster, view.shard_id);
                guards.push(TxnGuard {
                    key: key.clone(),
                    revision: 0,
                });
                ops.push(TxnOp::Put {
                    key,
                    value: encode(view)?,
                });
            }
            self.kv.txn(guards, ops).await?;
        }
        Ok(())
    }

    pub async fn list_shard_views(&self, cluster: ClusterId) -> MetaResult<Vec<ShardViewRecord>> {
        let prefix = keys::shard_view_prefix(&self.root, cluster);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            out.push(decode::<ShardViewRecord>(&kv.value)?);
        }
        Ok(out)
    }

    /// CAS-update one shard view: succeeds only when the persisted version
    /// equals `prev_version`, and the new record's version must be greater.
    pub async fn update_shard_view(
        &self,
        cluster: ClusterId,
        record: &ShardViewRecord,
        prev_version: u64,
    ) -> MetaResult<()> {
        debug_assert!(record.version > prev_version);
        let key = keys::shard_view_key(&self.root, cluster, record.shard_id);
        let current = self
            .kv
            .get(&key)
            .await?
            .ok_or(MetaError::ShardNotFound(record.shard_id))?;
        let persisted: ShardViewRecord = decode(&current.value)?;
        if persisted.version != prev_version {
            return Err(MetaError::VersionConflict {
                key,
                expected: prev_version,
                found: persisted.version,
            });
        }
        self.kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: current.mod_revision,
                }],
                vec![TxnOp::Put {
                    key,
                    value: encode(record)?,
                }],
            )
            .await
    }

    // ── Cluster view ───────────────────────────────────────────────────────

    pub async fn create_cluster_view(
        &self,
        cluster: ClusterId,
        record: &ClusterViewRecord,
    ) -> MetaResult<()> {
        let key = keys::cluster_view_key(&self.root, cluster);
        self.kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: 0,
                }],
                vec![TxnOp::Put {
                    key,
                    value: encode(record)?,
                }],
            )
            .await
    }

    pub async fn get_cluster_view(
        &self,
        cluster: ClusterId,
    ) -> MetaResult<Option<ClusterViewRecord>> {
        let key = keys::cluster_view_key(&self.root, cluster);
        match self.kv.get(&key).await? {
            Some(kv) => Ok(Some(decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    pub async fn update_cluster_view(
        &self,
        cluster: ClusterId,
        record: &ClusterViewRecord,
        prev_version: u64,
    ) -> MetaResult<()> {
        debug_assert!(record.version > prev_version);
        let key = keys::cluster_view_key(&self.root, cluster);
        let current = self.kv.get(&key).await?.ok_or_else(|| {
            MetaError::InvalidTopology {
                cluster,
                reason: "cluster view does not exist".into(),
            }
        })?;
        let persisted: ClusterViewRecord = decode(&current.value)?;
        if persisted.version != prev_version {
            return Err(MetaError::VersionConflict {
                key,
                expected: prev_version,
                found: persisted.version,
            });
        }
        self.kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: current.mod_revision,
                }],
                vec![TxnOp::Put {
                    key,
                    value: encode(record)?,
                }],
            )
            .await
    }

    // ── Nodes ──────────────────────────────────────────────────────────────

    pub async fn create_or_update_node(
        &self,
        cluster: ClusterId,
        record: &NodeRecord,
    ) -> MetaResult<()> {
        let key = keys::node_key(&self.root, cluster, &record.name);
        self.kv.put(&key, encode(record)?).await?;
        Ok(())
    }

    pub async fn list_nodes(&self, cluster: ClusterId) -> MetaResult<Vec<NodeRecord>> {
        let prefix = keys::node_prefix(&self.root, cluster);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            out.push(decode::<NodeRecord>(&kv.value)?);
        }
        Ok(out)
    }

    // ── Procedures ─────────────────────────────────────────────────────────

    pub async fn save_procedure(&self, record: &ProcedureRecord) -> MetaResult<()> {
        let key = keys::procedure_key(&self.root, &record.kind, record.id);
        let mut record = record.clone();
        record.modified_at = now_ms();
        self.kv.put(&key, encode(&record)?).await?;
        Ok(())
    }

    pub async fn list_procedures(&self) -> MetaResult<Vec<ProcedureRecord>> {
        let prefix = keys::procedure_prefix(&self.root);
        let mut out = Vec::new();
        for kv in kv::list_all(self.kv.as_ref(), &prefix).await? {
            out.push(decode::<ProcedureRecord>(&kv.value)?);
        }
        Ok(out)
    }

    pub async fn list_unfinished_procedures(&self) -> MetaResult<Vec<ProcedureRecord>> {
        Ok(self
            .list_procedures()
            .await?
            .into_iter()
            .filter(|p| !p.state.is_terminal())
            .collect())
    }

    pub async fn delete_procedure(&self, kind: &str, id: ProcedureId) -> MetaResult<()> {
        let key = keys::procedure_key(&self.root, kind, id);
        self.kv.delete(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    fn storage() -> MetaStorage {
        MetaStorage::new(Arc::new(MemKv::new()), "/tessera")
    }

    fn cluster_record() -> ClusterRecord {
        ClusterRecord {
            id: ClusterId(1),
            name: "defaultCluster".into(),
            min_node_count: 2,
            shard_total: 4,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
            created_at: now_ms(),
            modified_at: now_ms(),
        }
    }

    fn shard_view(shard: u32, version: u64, tables: &[u64]) -> ShardViewRecord {
        ShardViewRecord {
            shard_id: ShardId(shard),
            version,
            table_ids: tables.iter().map(|t| TableId(*t)).collect(),
            created_at: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_create_cluster_twice_fails() {
        let s = storage();
        s.create_cluster(&cluster_record()).await.unwrap();
        let err = s.create_cluster(&cluster_record()).await.unwrap_err();
        assert!(matches!(err, MetaError::ClusterAlreadyExists(_)));
        assert_eq!(s.list_clusters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_clusters_skips_nested_keys() {
        let s = storage();
        s.create_cluster(&cluster_record()).await.unwrap();
        s.create_schema(&SchemaRecord {
            id: SchemaId(1),
            cluster_id: ClusterId(1),
            name: "public".into(),
            created_at: now_ms(),
        })
        .await
        .unwrap();
        let clusters = s.list_clusters().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "defaultCluster");
    }

    #[tokio::test]
    async fn test_table_create_get_delete() {
        let s = storage();
        let table = TableRecord {
            id: TableId(100),
            name: "cpu".into(),
            schema_id: SchemaId(1),
            partition_info: None,
            created_at: now_ms(),
        };
        s.create_table(ClusterId(1), &table).await.unwrap();
        let got = s
            .get_table(ClusterId(1), SchemaId(1), "cpu")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, TableId(100));
        assert!(!got.is_partitioned());

        let err = s.create_table(ClusterId(1), &table).await.unwrap_err();
        assert!(matches!(err, MetaError::TableAlreadyExists(_)));

        s.delete_table(ClusterId(1), SchemaId(1), "cpu").await.unwrap();
        assert!(s
            .get_table(ClusterId(1), SchemaId(1), "cpu")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_shard_view_cas() {
        let s = storage();
        s.create_shard_views(ClusterId(1), &[shard_view(0, 0, &[])])
            .await
            .unwrap();

        s.update_shard_view(ClusterId(1), &shard_view(0, 1, &[10]), 0)
            .await
            .unwrap();

        // Stale prev_version must conflict.
        let err = s
            .update_shard_view(ClusterId(1), &shard_view(0, 2, &[10, 11]), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));

        let views = s.list_shard_views(ClusterId(1)).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].version, 1);
        assert_eq!(views[0].table_ids, vec![TableId(10)]);
    }

    #[tokio::test]
    async fn test_shard_view_batch_splits_large_creates() {
        let s = storage();
        let views: Vec<ShardViewRecord> =
            (0..(MAX_OPS_PER_TXN as u32 * 2 + 3)).map(|i| shard_view(i, 0, &[])).collect();
        s.create_shard_views(ClusterId(1), &views).await.unwrap();
        assert_eq!(
            s.list_shard_views(ClusterId(1)).await.unwrap().len(),
            views.len()
        );
    }

    #[tokio::test]
    async fn test_cluster_view_cas() {
        let s = storage();
        let view = ClusterViewRecord {
            cluster_id: ClusterId(1),
            version: 0,
            state: ClusterState::Empty,
            shard_nodes: vec![],
            created_at: now_ms(),
        };
        s.create_cluster_view(ClusterId(1), &view).await.unwrap();

        let mut next = view.clone();
        next.version = 1;
        next.state = ClusterState::Stable;
        s.update_cluster_view(ClusterId(1), &next, 0).await.unwrap();

        let err = s.update_cluster_view(ClusterId(1), &next, 0).await.unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));

        let got = s.get_cluster_view(ClusterId(1)).await.unwrap().unwrap();
        assert_eq!(got.state, ClusterState::Stable);
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn test_node_upsert() {
        let s = storage();
        let mut node = NodeRecord {
            name: "node-0".into(),
            stats: NodeStats::default(),
            last_touch_time: 1,
            state: NodeState::Online,
        };
        s.create_or_update_node(ClusterId(1), &node).await.unwrap();
        node.last_touch_time = 2;
        s.create_or_update_node(ClusterId(1), &node).await.unwrap();
        let nodes = s.list_nodes(ClusterId(1)).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].last_touch_time, 2);
    }

    #[tokio::test]
    async fn test_procedure_persistence_round_trip() {
        let s = storage();
        let mut record = ProcedureRecord {
            id: ProcedureId(1),
            kind: "create_table".into(),
            state: ProcedureState::Init,
            cluster_id: ClusterId(1),
            raw_state: serde_json::json!({"step": "pick_shard"}),
            created_at: now_ms(),
            modified_at: now_ms(),
        };
        s.save_procedure(&record).await.unwrap();
        record.state = ProcedureState::Running;
        s.save_procedure(&record).await.unwrap();

        let unfinished = s.list_unfinished_procedures().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].state, ProcedureState::Running);

        record.state = ProcedureState::Finished;
        s.save_procedure(&record).await.unwrap();
        assert!(s.list_unfinished_procedures().await.unwrap().is_empty());
        assert_eq!(s.list_procedures().await.unwrap().len(), 1);
    }
}
