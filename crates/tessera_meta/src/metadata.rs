//! The cluster metadata model: cached state plus CAS-versioned mutators.
//!
//! Every mutator follows the same order: (1) write the KV, CAS-guarded for
//! versioned records, (2) on success update the cache under the writer
//! lock, (3) the new version is visible to the next snapshot. The writer
//! lock is never held across I/O; a CAS loser refreshes its cache entry
//! from the KV and surfaces `VersionConflict` to the caller, who owns the
//! re-read-and-retry policy.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tessera_common::{
    now_ms, ClusterId, ClusterState, MetaError, MetaResult, SchemaId, ShardId, TableId,
    TopologyType,
};
use tessera_storage::{
    ClusterRecord, ClusterViewRecord, IdAllocator, MetaStorage, NodeRecord, NodeStats,
    PartitionInfo, ReusableIdAllocator, SchemaRecord, ShardNode, ShardViewRecord, TableRecord,
    DEFAULT_ALLOC_STEP,
};

use crate::topology::{ClusterSnapshot, ShardInfo, Topology};

/// A node row together with the shard state it last advertised.
#[derive(Debug, Clone)]
pub struct RegisteredNode {
    pub node: NodeRecord,
    pub shard_infos: Vec<ShardInfo>,
}

/// Route resolution for one table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub table: TableRecord,
    pub shard_id: ShardId,
    pub node_name: String,
    pub shard_version: u64,
}

/// The tables hosted on one shard, with the shard's version.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ShardTables {
    pub shard_id: ShardId,
    pub version: u64,
    pub tables: Vec<TableRecord>,
}

struct CachedState {
    cluster: ClusterRecord,
    cluster_view: ClusterViewRecord,
    shard_views: BTreeMap<ShardId, ShardViewRecord>,
    /// schema name → record
    schemas: HashMap<String, SchemaRecord>,
    /// schema id → (table name → record)
    tables: HashMap<SchemaId, HashMap<String, TableRecord>>,
    /// table id → (schema id, table name); kept in lockstep with `tables`
    table_index: HashMap<TableId, (SchemaId, String)>,
    nodes: BTreeMap<String, NodeRecord>,
}

/// Authoritative in-memory model of one cluster.
pub struct ClusterMetadata {
    cluster_id: ClusterId,
    storage: MetaStorage,
    schema_alloc: IdAllocator,
    table_alloc: IdAllocator,
    /// Shard IDs may be reused (a merged-away shard's ID can come back);
    /// table and schema IDs never go through this allocator.
    shard_alloc: ReusableIdAllocator,
    state: RwLock<CachedState>,
    /// node name → shard state it last advertised over heartbeat.
    shard_infos: RwLock<HashMap<String, Vec<ShardInfo>>>,
}

impl std::fmt::Debug for ClusterMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMetadata")
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}

impl ClusterMetadata {
    pub fn new(storage: MetaStorage, cluster: ClusterRecord) -> Self {
        let cluster_id = cluster.id;
        let root = storage.root().to_string();
        let schema_alloc = IdAllocator::new(
            storage.kv().clone(),
            tessera_storage::keys::alloc_id_key(&root, &format!("schema/{}", cluster_id.0)),
            DEFAULT_ALLOC_STEP,
        );
        let table_alloc = IdAllocator::new(
            storage.kv().clone(),
            tessera_storage::keys::alloc_id_key(&root, &format!("table/{}", cluster_id.0)),
            DEFAULT_ALLOC_STEP,
        );
        let shard_alloc = ReusableIdAllocator::new(
            storage.kv().clone(),
            tessera_storage::keys::alloc_id_key(&root, &format!("shard/{}", cluster_id.0)),
            DEFAULT_ALLOC_STEP,
            vec![],
        );
        Self {
            cluster_id,
            storage,
            schema_alloc,
            table_alloc,
            shard_alloc,
            state: RwLock::new(CachedState {
                cluster,
                cluster_view: ClusterViewRecord {
                    cluster_id,
                    version: 0,
                    state: ClusterState::Empty,
                    shard_nodes: vec![],
                    created_at: now_ms(),
                },
                shard_views: BTreeMap::new(),
                schemas: HashMap::new(),
                tables: HashMap::new(),
                table_index: HashMap::new(),
                nodes: BTreeMap::new(),
            }),
            shard_infos: RwLock::new(HashMap::new()),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn name(&self) -> String {
        self.state.read().cluster.name.clone()
    }

    pub fn cluster(&self) -> ClusterRecord {
        self.state.read().cluster.clone()
    }

    pub fn storage(&self) -> &MetaStorage {
        &self.storage
    }

    // ── Bootstrap & load ───────────────────────────────────────────────────

    /// Persist the initial topology of a fresh cluster: an empty cluster
    /// view and one empty shard view per shard.
    pub async fn init_topology(&self) -> MetaResult<()> {
        let cluster_view = ClusterViewRecord {
            cluster_id: self.cluster_id,
            version: 0,
            state: ClusterState::Empty,
            shard_nodes: vec![],
            created_at: now_ms(),
        };
        let shard_total = self.state.read().cluster.shard_total;
        let mut shard_views = Vec::with_capacity(shard_total as usize);
        for _ in 0..shard_total {
            let id = ShardId(self.shard_alloc.alloc().await? as u32);
            shard_views.push(ShardViewRecord {
                shard_id: id,
                version: 0,
                table_ids: vec![],
                created_at: now_ms(),
            });
        }
        self.storage
            .create_cluster_view(self.cluster_id, &cluster_view)
            .await?;
        self.storage
            .create_shard_views(self.cluster_id, &shard_views)
            .await?;

        let mut state = self.state.write();
        state.cluster_view = cluster_view;
        state.shard_views = shard_views.into_iter().map(|v| (v.shard_id, v)).collect();
        info!(cluster = %self.cluster_id, shards = state.shard_views.len(), "initialized topology");
        Ok(())
    }

    /// Rebuild the cache from the KV: cluster view, shard views, schemas,
    /// nodes, then tables.
    pub async fn load(&self) -> MetaResult<()> {
        let cluster_view = self
            .storage
            .get_cluster_view(self.cluster_id)
            .await?
            .ok_or(MetaError::InvalidTopology {
                cluster: self.cluster_id,
                reason: "cluster view not found on load".into(),
            })?;
        let shard_views = self.storage.list_shard_views(self.cluster_id).await?;
        let schemas = self.storage.list_schemas(self.cluster_id).await?;
        let nodes = self.storage.list_nodes(self.cluster_id).await?;

        let mut tables: HashMap<SchemaId, HashMap<String, TableRecord>> = HashMap::new();
        let mut table_index = HashMap::new();
        for schema in &schemas {
            let rows = self.storage.list_tables(self.cluster_id, schema.id).await?;
            let by_name: HashMap<String, TableRecord> = rows
                .into_iter()
                .inspect(|t| {
                    table_index.insert(t.id, (schema.id, t.name.clone()));
                })
                .map(|t| (t.name.clone(), t))
                .collect();
            tables.insert(schema.id, by_name);
        }

        let mut state = self.state.write();
        state.cluster_view = cluster_view;
        state.shard_views = shard_views.into_iter().map(|v| (v.shard_id, v)).collect();
        state.schemas = schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        state.nodes = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        state.tables = tables;
        state.table_index = table_index;
        debug!(cluster = %self.cluster_id, "metadata cache loaded");
        Ok(())
    }

    /// Value-copied snapshot for readers.
    pub fn snapshot(&self) -> ClusterSnapshot {
        let state = self.state.read();
        ClusterSnapshot {
            cluster: state.cluster.clone(),
            topology: Topology {
                cluster_view: state.cluster_view.clone(),
                shard_views: state.shard_views.clone(),
            },
            nodes: state.nodes.clone(),
        }
    }

    // ── Schemas ────────────────────────────────────────────────────────────

    /// Idempotent by name: an existing schema is returned unchanged.
    pub async fn get_or_create_schema(&self, schema_name: &str) -> MetaResult<SchemaRecord> {
        if let Some(existing) = self.state.read().schemas.get(schema_name) {
            return Ok(existing.clone());
        }

        let id = SchemaId(self.schema_alloc.alloc().await? as u32);
        let record = SchemaRecord {
            id,
            cluster_id: self.cluster_id,
            name: schema_name.to_string(),
            created_at: now_ms(),
        };
        self.storage.create_schema(&record).await?;

        let mut state = self.state.write();
        // A racing create may have won; keep the first one cached.
        let entry = state
            .schemas
            .entry(schema_name.to_string())
            .or_insert_with(|| record.clone());
        Ok(entry.clone())
    }

    pub fn get_schema(&self, schema_name: &str) -> Option<SchemaRecord> {
        self.state.read().schemas.get(schema_name).cloned()
    }

    // ── Tables ─────────────────────────────────────────────────────────────

    /// Resolve a table from the cache; never touches the KV.
    pub fn get_table(&self, schema_name: &str, table_name: &str) -> Option<TableRecord> {
        let state = self.state.read();
        let schema = state.schemas.get(schema_name)?;
        state.tables.get(&schema.id)?.get(table_name).cloned()
    }

    pub fn get_table_by_id(&self, table_id: TableId) -> Option<TableRecord> {
        let state = self.state.read();
        let (schema_id, name) = state.table_index.get(&table_id)?;
        state.tables.get(schema_id)?.get(name).cloned()
    }

    pub fn list_tables(&self, schema_name: &str) -> Vec<TableRecord> {
        let state = self.state.read();
        match state.schemas.get(schema_name) {
            Some(schema) => state
                .tables
                .get(&schema.id)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default(),
            None => vec![],
        }
    }

    /// Create the table row. Idempotent by name: repeating returns the
    /// existing record. Shard placement is a separate step.
    pub async fn create_table_metadata(
        &self,
        schema_name: &str,
        table_name: &str,
        partition_info: Option<PartitionInfo>,
    ) -> MetaResult<TableRecord> {
        let schema = self
            .get_schema(schema_name)
            .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string()))?;

        if let Some(existing) = self.get_table(schema_name, table_name) {
            return Ok(existing);
        }

        let id = TableId(self.table_alloc.alloc().await?);
        let record = TableRecord {
            id,
            name: table_name.to_string(),
            schema_id: schema.id,
            partition_info,
            created_at: now_ms(),
        };
        match self.storage.create_table(self.cluster_id, &record).await {
            Ok(()) => {}
            Err(MetaError::TableAlreadyExists(_)) => {
                // Lost a race; adopt the winner's row.
                let winner = self
                    .storage
                    .get_table(self.cluster_id, schema.id, table_name)
                    .await?
                    .ok_or_else(|| MetaError::table_not_found(schema.id, table_name))?;
                let mut state = self.state.write();
                state.table_index.insert(winner.id, (schema.id, winner.name.clone()));
                state
                    .tables
                    .entry(schema.id)
                    .or_default()
                    .insert(winner.name.clone(), winner.clone());
                return Ok(winner);
            }
            Err(other) => return Err(other),
        }

        let mut state = self.state.write();
        state.table_index.insert(id, (schema.id, record.name.clone()));
        state
            .tables
            .entry(schema.id)
            .or_default()
            .insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Delete the table row. Returns the removed record, `None` when the
    /// table was already gone (drop is idempotent by name).
    pub async fn drop_table_metadata(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> MetaResult<Option<TableRecord>> {
        let schema = self
            .get_schema(schema_name)
            .ok_or_else(|| MetaError::SchemaNotFound(schema_name.to_string()))?;
        let existing = self.get_table(schema_name, table_name);
        self.storage
            .delete_table(self.cluster_id, schema.id, table_name)
            .await?;

        if let Some(record) = &existing {
            let mut state = self.state.write();
            state.table_index.remove(&record.id);
            if let Some(by_name) = state.tables.get_mut(&schema.id) {
                by_name.remove(table_name);
            }
        }
        Ok(existing)
    }

    // ── Shard views ────────────────────────────────────────────────────────

    pub fn shard_view(&self, shard_id: ShardId) -> Option<ShardViewRecord> {
        self.state.read().shard_views.get(&shard_id).cloned()
    }

    /// CAS the table into the shard's view. Returns the new shard version.
    /// Idempotent: if the table is already on this shard the current
    /// version is returned and nothing is written.
    pub async fn add_table_to_shard(
        &self,
        shard_id: ShardId,
        table_id: TableId,
    ) -> MetaResult<u64> {
        let (record, prev_version) = {
            let state = self.state.read();
            let view = state
                .shard_views
                .get(&shard_id)
                .ok_or(MetaError::ShardNotFound(shard_id))?;
            if view.table_ids.contains(&table_id) {
                return Ok(view.version);
            }
            // A table lives on at most one shard at any committed version.
            for other in state.shard_views.values() {
                if other.table_ids.contains(&table_id) {
                    return Err(MetaError::InvalidTopology {
                        cluster: self.cluster_id,
                        reason: format!("{table_id} already placed on {}", other.shard_id),
                    });
                }
            }
            let mut record = view.clone();
            record.version += 1;
            record.table_ids.push(table_id);
            (record, view.version)
        };
        self.commit_shard_view(record, prev_version).await
    }

    /// CAS the table out of the shard's view. Returns the new version; the
    /// current version when the table was not present.
    pub async fn remove_table_from_shard(
        &self,
        shard_id: ShardId,
        table_id: TableId,
    ) -> MetaResult<u64> {
        let (record, prev_version) = {
            let state = self.state.read();
            let view = state
                .shard_views
                .get(&shard_id)
                .ok_or(MetaError::ShardNotFound(shard_id))?;
            if !view.table_ids.contains(&table_id) {
                return Ok(view.version);
            }
            let mut record = view.clone();
            record.version += 1;
            record.table_ids.retain(|t| *t != table_id);
            (record, view.version)
        };
        self.commit_shard_view(record, prev_version).await
    }

    /// Replace a shard view wholesale (split moves table subsets).
    pub async fn replace_shard_view(
        &self,
        shard_id: ShardId,
        table_ids: Vec<TableId>,
    ) -> MetaResult<u64> {
        let (record, prev_version) = {
            let state = self.state.read();
            let view = state
                .shard_views
                .get(&shard_id)
                .ok_or(MetaError::ShardNotFound(shard_id))?;
            let mut record = view.clone();
            record.version += 1;
            record.table_ids = table_ids;
            (record, view.version)
        };
        self.commit_shard_view(record, prev_version).await
    }

    /// Allocate a cluster-unique shard ID (split targets).
    pub async fn alloc_shard_id(&self) -> MetaResult<ShardId> {
        Ok(ShardId(self.shard_alloc.alloc().await? as u32))
    }

    /// Return a shard ID to the reusable pool.
    pub async fn collect_shard_id(&self, shard_id: ShardId) {
        self.shard_alloc.collect(shard_id.0 as u64).await;
    }

    /// Persist a brand-new shard view (split target).
    pub async fn create_shard_view(&self, shard_id: ShardId) -> MetaResult<()> {
        let record = ShardViewRecord {
            shard_id,
            version: 0,
            table_ids: vec![],
            created_at: now_ms(),
        };
        self.storage
            .create_shard_views(self.cluster_id, std::slice::from_ref(&record))
            .await?;
        self.state.write().shard_views.insert(shard_id, record);
        Ok(())
    }

    async fn commit_shard_view(
        &self,
        record: ShardViewRecord,
        prev_version: u64,
    ) -> MetaResult<u64> {
        let version = record.version;
        match self
            .storage
            .update_shard_view(self.cluster_id, &record, prev_version)
            .await
        {
            Ok(()) => {
                let mut state = self.state.write();
                let entry = state.shard_views.entry(record.shard_id).or_insert_with(|| record.clone());
                if entry.version < record.version {
                    *entry = record;
                }
                Ok(version)
            }
            Err(err @ MetaError::VersionConflict { .. }) => {
                // Another writer won; refresh the cache so the caller's
                // re-read observes the committed state.
                self.refresh_shard_views().await?;
                Err(err)
            }
            Err(other) => Err(other),
        }
    }

    async fn refresh_shard_views(&self) -> MetaResult<()> {
        let views = self.storage.list_shard_views(self.cluster_id).await?;
        let mut state = self.state.write();
        for view in views {
            let entry = state.shard_views.entry(view.shard_id).or_insert_with(|| view.clone());
            if entry.version < view.version {
                *entry = view;
            }
        }
        Ok(())
    }

    // ── Cluster view ───────────────────────────────────────────────────────

    /// CAS the cluster view to a new placement. Validates the structural
    /// invariants against the node registry before writing. Returns the new
    /// version.
    pub async fn apply_cluster_view(
        &self,
        new_state: ClusterState,
        shard_nodes: Vec<ShardNode>,
    ) -> MetaResult<u64> {
        let (record, prev_version) = {
            let state = self.state.read();
            for sn in &shard_nodes {
                if !state.nodes.contains_key(&sn.node_name) {
                    return Err(MetaError::NodeNotFound(sn.node_name.clone()));
                }
            }
            let record = ClusterViewRecord {
                cluster_id: self.cluster_id,
                version: state.cluster_view.version + 1,
                state: new_state,
                shard_nodes,
                created_at: now_ms(),
            };
            (record, state.cluster_view.version)
        };

        {
            let state = self.state.read();
            let topology = Topology {
                cluster_view: record.clone(),
                shard_views: BTreeMap::new(),
            };
            topology.validate(&state.nodes)?;
        }

        let version = record.version;
        match self
            .storage
            .update_cluster_view(self.cluster_id, &record, prev_version)
            .await
        {
            Ok(()) => {
                let mut state = self.state.write();
                if state.cluster_view.version < record.version {
                    state.cluster_view = record;
                }
                info!(cluster = %self.cluster_id, version, state = ?new_state, "cluster view updated");
                Ok(version)
            }
            Err(err @ MetaError::VersionConflict { .. }) => {
                if let Some(view) = self.storage.get_cluster_view(self.cluster_id).await? {
                    let mut state = self.state.write();
                    if state.cluster_view.version < view.version {
                        state.cluster_view = view;
                    }
                }
                Err(err)
            }
            Err(other) => Err(other),
        }
    }

    // ── Nodes ──────────────────────────────────────────────────────────────

    /// Upsert the node row and refresh its liveness timestamp; placement is
    /// never touched here — that is the scheduler's job.
    pub async fn register_node(
        &self,
        node_name: &str,
        stats: NodeStats,
        shard_infos: Vec<ShardInfo>,
    ) -> MetaResult<()> {
        let record = NodeRecord {
            name: node_name.to_string(),
            stats,
            last_touch_time: now_ms(),
            state: tessera_common::NodeState::Online,
        };
        self.storage
            .create_or_update_node(self.cluster_id, &record)
            .await?;

        self.state
            .write()
            .nodes
            .insert(node_name.to_string(), record);
        self.shard_infos
            .write()
            .insert(node_name.to_string(), shard_infos);
        Ok(())
    }

    pub fn node_shard_infos(&self, node_name: &str) -> Option<Vec<ShardInfo>> {
        self.shard_infos.read().get(node_name).cloned()
    }

    pub fn list_registered_nodes(&self) -> Vec<RegisteredNode> {
        let state = self.state.read();
        let infos = self.shard_infos.read();
        state
            .nodes
            .values()
            .map(|n| RegisteredNode {
                node: n.clone(),
                shard_infos: infos.get(&n.name).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Transition nodes whose heartbeat expired to `Offline`, persisting
    /// the state change. Returns the names that flipped.
    pub async fn expire_nodes(&self, timeout_ms: u64) -> MetaResult<Vec<String>> {
        let now = now_ms();
        let expired: Vec<NodeRecord> = {
            let state = self.state.read();
            state
                .nodes
                .values()
                .filter(|n| {
                    n.state == tessera_common::NodeState::Online
                        && now.saturating_sub(n.last_touch_time) >= timeout_ms
                })
                .cloned()
                .collect()
        };

        let mut flipped = Vec::with_capacity(expired.len());
        for mut node in expired {
            node.state = tessera_common::NodeState::Offline;
            self.storage
                .create_or_update_node(self.cluster_id, &node)
                .await?;
            warn!(cluster = %self.cluster_id, node = %node.name, "node heartbeat expired");
            flipped.push(node.name.clone());
            self.state.write().nodes.insert(node.name.clone(), node);
        }
        Ok(flipped)
    }

    // ── Queries ────────────────────────────────────────────────────────────

    /// Resolve tables to their shard and shard leader. Unknown tables are
    /// omitted, matching the lookup-only contract of routing.
    pub fn route_tables(&self, schema_name: &str, table_names: &[String]) -> Vec<RouteEntry> {
        let state = self.state.read();
        let Some(schema) = state.schemas.get(schema_name) else {
            return vec![];
        };
        let Some(by_name) = state.tables.get(&schema.id) else {
            return vec![];
        };

        let mut out = Vec::new();
        for name in table_names {
            let Some(table) = by_name.get(name) else {
                continue;
            };
            let Some(view) = state
                .shard_views
                .values()
                .find(|v| v.table_ids.contains(&table.id))
            else {
                continue;
            };
            let Some(leader) = state
                .cluster_view
                .shard_nodes
                .iter()
                .find(|sn| sn.shard_id == view.shard_id && sn.role == tessera_common::ShardRole::Leader)
            else {
                continue;
            };
            out.push(RouteEntry {
                table: table.clone(),
                shard_id: view.shard_id,
                node_name: leader.node_name.clone(),
                shard_version: view.version,
            });
        }
        out
    }

    /// The table sets of the given shards (all shards when empty).
    pub fn shard_tables(&self, shard_ids: &[ShardId]) -> MetaResult<Vec<ShardTables>> {
        let state = self.state.read();
        let ids: Vec<ShardId> = if shard_ids.is_empty() {
            state.shard_views.keys().copied().collect()
        } else {
            shard_ids.to_vec()
        };

        let mut out = Vec::with_capacity(ids.len());
        for shard_id in ids {
            let view = state
                .shard_views
                .get(&shard_id)
                .ok_or(MetaError::ShardNotFound(shard_id))?;
            let tables = view
                .table_ids
                .iter()
                .filter_map(|id| {
                    let (schema_id, name) = state.table_index.get(id)?;
                    state.tables.get(schema_id)?.get(name).cloned()
                })
                .collect();
            out.push(ShardTables {
                shard_id,
                version: view.version,
                tables,
            });
        }
        Ok(out)
    }

    /// Update the mutable cluster attributes (topology type, batch size).
    pub async fn update_cluster_opts(
        &self,
        topology_type: Option<TopologyType>,
        batch_size: Option<u32>,
    ) -> MetaResult<ClusterRecord> {
        let mut record = self.cluster();
        if let Some(t) = topology_type {
            record.topology_type = t;
        }
        if let Some(b) = batch_size {
            record.procedure_executing_batch_size = b;
        }
        self.storage.update_cluster(&record).await?;
        self.state.write().cluster = record.clone();
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_storage::MemKv;

    async fn test_metadata() -> ClusterMetadata {
        let storage = MetaStorage::new(Arc::new(MemKv::new()), "/tessera");
        let cluster = ClusterRecord {
            id: ClusterId(1),
            name: "defaultCluster".into(),
            min_node_count: 2,
            shard_total: 4,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
            created_at: now_ms(),
            modified_at: now_ms(),
        };
        storage.create_cluster(&cluster).await.unwrap();
        let meta = ClusterMetadata::new(storage, cluster);
        meta.init_topology().await.unwrap();
        meta
    }

    #[tokio::test]
    async fn test_get_or_create_schema_is_idempotent() {
        let meta = test_metadata().await;
        let a = meta.get_or_create_schema("public").await.unwrap();
        let b = meta.get_or_create_schema("public").await.unwrap();
        assert_eq!(a.id, b.id);
        let c = meta.get_or_create_schema("metrics").await.unwrap();
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_create_table_is_idempotent() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        let a = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        let b = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(meta.get_table("public", "cpu").unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_add_table_to_shard_bumps_version_once() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        let table = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();

        let v1 = meta.add_table_to_shard(ShardId(0), table.id).await.unwrap();
        assert_eq!(v1, 1);
        // Idempotent replay touches nothing.
        let v2 = meta.add_table_to_shard(ShardId(0), table.id).await.unwrap();
        assert_eq!(v2, 1);
    }

    #[tokio::test]
    async fn test_table_cannot_live_on_two_shards() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        let table = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        meta.add_table_to_shard(ShardId(0), table.id).await.unwrap();
        let err = meta
            .add_table_to_shard(ShardId(1), table.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidTopology { .. }));
    }

    #[tokio::test]
    async fn test_remove_table_restores_view_except_version() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        let before = meta.shard_view(ShardId(2)).unwrap();

        let table = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        meta.add_table_to_shard(ShardId(2), table.id).await.unwrap();
        meta.remove_table_from_shard(ShardId(2), table.id)
            .await
            .unwrap();

        let after = meta.shard_view(ShardId(2)).unwrap();
        assert_eq!(after.table_ids, before.table_ids);
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn test_register_node_then_cluster_view() {
        let meta = test_metadata().await;
        meta.register_node("node-0", NodeStats::default(), vec![])
            .await
            .unwrap();

        // Referencing an unregistered node is rejected.
        let err = meta
            .apply_cluster_view(
                ClusterState::Stable,
                vec![ShardNode {
                    shard_id: ShardId(0),
                    role: tessera_common::ShardRole::Leader,
                    node_name: "ghost".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::NodeNotFound(_)));

        let version = meta
            .apply_cluster_view(
                ClusterState::Stable,
                vec![ShardNode {
                    shard_id: ShardId(0),
                    role: tessera_common::ShardRole::Leader,
                    node_name: "node-0".into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(meta.snapshot().state(), ClusterState::Stable);
    }

    #[tokio::test]
    async fn test_route_tables_resolves_leader() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        meta.register_node("node-0", NodeStats::default(), vec![])
            .await
            .unwrap();
        meta.apply_cluster_view(
            ClusterState::Stable,
            vec![ShardNode {
                shard_id: ShardId(0),
                role: tessera_common::ShardRole::Leader,
                node_name: "node-0".into(),
            }],
        )
        .await
        .unwrap();

        let table = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        meta.add_table_to_shard(ShardId(0), table.id).await.unwrap();

        let routes = meta.route_tables("public", &["cpu".into(), "missing".into()]);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].node_name, "node-0");
        assert_eq!(routes[0].shard_id, ShardId(0));

        let shard_tables = meta.shard_tables(&[ShardId(0)]).unwrap();
        assert_eq!(shard_tables[0].tables.len(), 1);
        assert_eq!(shard_tables[0].tables[0].name, "cpu");
    }

    #[tokio::test]
    async fn test_expire_nodes_flips_state_and_keeps_row() {
        let meta = test_metadata().await;
        meta.register_node("node-0", NodeStats::default(), vec![])
            .await
            .unwrap();
        // Timeout of zero expires everything immediately.
        let flipped = meta.expire_nodes(0).await.unwrap();
        assert_eq!(flipped, vec!["node-0".to_string()]);
        let nodes = meta.list_registered_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node.state, tessera_common::NodeState::Offline);
    }

    #[tokio::test]
    async fn test_load_rebuilds_cache() {
        let meta = test_metadata().await;
        meta.get_or_create_schema("public").await.unwrap();
        let table = meta
            .create_table_metadata("public", "cpu", None)
            .await
            .unwrap();
        meta.add_table_to_shard(ShardId(1), table.id).await.unwrap();
        meta.register_node("node-0", NodeStats::default(), vec![])
            .await
            .unwrap();

        // A fresh instance over the same storage must observe everything.
        let reloaded = ClusterMetadata::new(meta.storage().clone(), meta.cluster());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get_table("public", "cpu").unwrap().id, table.id);
        assert_eq!(
            reloaded.shard_view(ShardId(1)).unwrap().table_ids,
            vec![table.id]
        );
        assert_eq!(reloaded.list_registered_nodes().len(), 1);
        assert_eq!(reloaded.get_table_by_id(table.id).unwrap().name, "cpu");
    }
}
