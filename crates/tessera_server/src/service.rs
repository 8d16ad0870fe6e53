//! The inbound service surface: every client-visible operation, shared by
//! the HTTP layer and by whatever wire framing fronts the service.
//!
//! Per cluster there is one procedure manager and one scheduler; they are
//! built when the cluster is created or loaded and owned here — explicit
//! values wired once at startup, no process-wide registries. Write paths
//! are leader-gated and externally triggered procedures pass the flow
//! limiter first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use tessera_common::config::MetaConfig;
use tessera_common::{
    MetaError, MetaResult, ProcedureId, ShardId, ShutdownSignal, TableId, TopologyType,
};
use tessera_coordinator::procedure::{
    CreatePartitionTableProcedure, CreateTableProcedure, DropPartitionTableProcedure,
    DropTableProcedure, Procedure, ProcedureInfo, ProcedureManager, SplitProcedure,
    TransferLeaderProcedure,
};
use tessera_coordinator::{
    EventDispatch, FlowLimiter, LeastTableShardPicker, Scheduler, ShardAffinityRule,
};
use tessera_meta::{
    ClusterManager, ClusterMetadata, ClusterSnapshot, CreateClusterOpts, RegisteredNode,
    RouteEntry, ShardTables,
};
use tessera_storage::{PartitionInfo, ProcedureState};

use crate::member::Member;

/// How long an external caller waits on the flow limiter before being
/// turned away.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-cluster coordination handles.
struct Coordination {
    manager: Arc<ProcedureManager>,
    scheduler: Arc<Scheduler>,
}

pub struct MetaService {
    config: MetaConfig,
    clusters: Arc<ClusterManager>,
    dispatch: Arc<dyn EventDispatch>,
    limiter: Arc<FlowLimiter>,
    member: Arc<Member>,
    coordinations: DashMap<String, Arc<Coordination>>,
    scheduler_shutdown: parking_lot::Mutex<Option<ShutdownSignal>>,
    shard_picker: LeastTableShardPicker,
}

impl MetaService {
    pub fn new(
        config: MetaConfig,
        clusters: Arc<ClusterManager>,
        dispatch: Arc<dyn EventDispatch>,
        limiter: Arc<FlowLimiter>,
        member: Arc<Member>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clusters,
            dispatch,
            limiter,
            member,
            coordinations: DashMap::new(),
            scheduler_shutdown: parking_lot::Mutex::new(None),
            shard_picker: LeastTableShardPicker,
        })
    }

    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    pub fn limiter(&self) -> &Arc<FlowLimiter> {
        &self.limiter
    }

    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    // ── Leadership ─────────────────────────────────────────────────────────

    fn require_leader(&self) -> MetaResult<()> {
        if self.member.is_leader() {
            return Ok(());
        }
        Err(MetaError::NotLeader { leader_hint: None })
    }

    /// Called when this instance wins the election: reload metadata from
    /// the KV, resume unfinished procedures, start schedulers.
    pub async fn on_elected(&self) -> MetaResult<()> {
        self.clusters.load().await?;
        self.ensure_coordinations().await?;

        let shutdown = ShutdownSignal::new();
        for entry in self.coordinations.iter() {
            let coordination = entry.value().clone();
            let resumed = coordination.manager.restore().await?;
            if resumed > 0 {
                info!(cluster = %entry.key(), resumed, "resumed procedures");
            }
            coordination.scheduler.clone().start(shutdown.clone());
        }
        *self.scheduler_shutdown.lock() = Some(shutdown);
        Ok(())
    }

    /// Called when leadership is lost: stop driving the cluster. In-flight
    /// procedures stop at their next step boundary; the new leader resumes
    /// them from the KV.
    pub fn on_leadership_lost(&self) {
        if let Some(shutdown) = self.scheduler_shutdown.lock().take() {
            shutdown.shutdown();
        }
        for entry in self.coordinations.iter() {
            entry.value().manager.stop();
        }
        self.coordinations.clear();
        warn!("leadership lost, coordination stopped");
    }

    async fn ensure_coordinations(&self) -> MetaResult<()> {
        for record in self.clusters.list_clusters() {
            if self.coordinations.contains_key(&record.name) {
                continue;
            }
            let meta = self.clusters.get_cluster(&record.name)?;
            self.build_coordination(&record.name, meta);
        }
        Ok(())
    }

    fn build_coordination(&self, name: &str, meta: Arc<ClusterMetadata>) -> Arc<Coordination> {
        let manager =
            ProcedureManager::new(meta.clone(), self.dispatch.clone(), self.config.procedure.clone());
        let scheduler = Scheduler::new(
            meta,
            manager.clone(),
            self.config.scheduler.clone(),
            self.config.heartbeat.clone(),
        );
        let coordination = Arc::new(Coordination { manager, scheduler });
        self.coordinations
            .insert(name.to_string(), coordination.clone());
        coordination
    }

    fn coordination(&self, cluster_name: &str) -> MetaResult<Arc<Coordination>> {
        if let Some(c) = self.coordinations.get(cluster_name) {
            return Ok(c.value().clone());
        }
        // Lazily wire clusters created while we were follower.
        let meta = self.clusters.get_cluster(cluster_name)?;
        Ok(self.build_coordination(cluster_name, meta))
    }

    pub fn scheduler(&self, cluster_name: &str) -> MetaResult<Arc<Scheduler>> {
        Ok(self.coordination(cluster_name)?.scheduler.clone())
    }

    async fn admit(&self) -> MetaResult<()> {
        self.limiter.acquire(ADMISSION_TIMEOUT).await
    }

    // ── Cluster admin ──────────────────────────────────────────────────────

    pub async fn create_cluster(
        &self,
        name: &str,
        opts: CreateClusterOpts,
    ) -> MetaResult<ClusterSnapshot> {
        self.require_leader()?;
        let meta = self.clusters.create_cluster(name, opts).await?;
        let coordination = self.build_coordination(name, meta.clone());
        if let Some(shutdown) = self.scheduler_shutdown.lock().as_ref() {
            coordination.scheduler.clone().start(shutdown.clone());
        }
        Ok(meta.snapshot())
    }

    pub async fn update_cluster(
        &self,
        name: &str,
        topology_type: Option<TopologyType>,
        batch_size: Option<u32>,
    ) -> MetaResult<ClusterSnapshot> {
        self.require_leader()?;
        let meta = self.clusters.get_cluster(name)?;
        meta.update_cluster_opts(topology_type, batch_size).await?;
        Ok(meta.snapshot())
    }

    pub fn list_clusters(&self) -> Vec<tessera_storage::ClusterRecord> {
        self.clusters.list_clusters()
    }

    pub fn snapshot(&self, cluster_name: &str) -> MetaResult<ClusterSnapshot> {
        Ok(self.clusters.get_cluster(cluster_name)?.snapshot())
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub fn route_tables(
        &self,
        cluster_name: &str,
        schema_name: &str,
        tables: &[String],
    ) -> MetaResult<Vec<RouteEntry>> {
        Ok(self
            .clusters
            .get_cluster(cluster_name)?
            .route_tables(schema_name, tables))
    }

    pub fn get_tables_of_shards(
        &self,
        cluster_name: &str,
        shard_ids: &[ShardId],
    ) -> MetaResult<Vec<ShardTables>> {
        self.clusters
            .get_cluster(cluster_name)?
            .shard_tables(shard_ids)
    }

    pub fn get_nodes(&self, cluster_name: &str) -> MetaResult<Vec<RegisteredNode>> {
        Ok(self
            .clusters
            .get_cluster(cluster_name)?
            .list_registered_nodes())
    }

    pub fn node_shards(&self, cluster_name: &str, node: &str) -> MetaResult<Vec<ShardId>> {
        let snapshot = self.snapshot(cluster_name)?;
        Ok(snapshot.topology.shards_on_node(node))
    }

    pub fn list_procedures(&self, cluster_name: &str) -> MetaResult<Vec<ProcedureInfo>> {
        Ok(self.coordination(cluster_name)?.manager.list_running())
    }

    pub fn cancel_procedure(&self, cluster_name: &str, id: ProcedureId) -> MetaResult<bool> {
        Ok(self.coordination(cluster_name)?.manager.cancel(id))
    }

    // ── ID allocation (data-node RPCs) ─────────────────────────────────────

    pub async fn alloc_schema_id(
        &self,
        cluster_name: &str,
        schema_name: &str,
    ) -> MetaResult<tessera_common::SchemaId> {
        self.require_leader()?;
        let meta = self.clusters.get_cluster(cluster_name)?;
        Ok(meta.get_or_create_schema(schema_name).await?.id)
    }

    /// Allocate (or fetch) the table ID for a name without placing the
    /// table on any shard.
    pub async fn alloc_table_id(
        &self,
        cluster_name: &str,
        schema_name: &str,
        table_name: &str,
    ) -> MetaResult<TableId> {
        self.require_leader()?;
        let meta = self.clusters.get_cluster(cluster_name)?;
        meta.get_or_create_schema(schema_name).await?;
        Ok(meta
            .create_table_metadata(schema_name, table_name, None)
            .await?
            .id)
    }

    // ── Write procedures ───────────────────────────────────────────────────

    /// Create a table (partitioned when `partition_info` is given) and
    /// wait for the procedure to terminate.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_table(
        &self,
        cluster_name: &str,
        schema_name: &str,
        table_name: &str,
        chosen_shard: Option<ShardId>,
        partition_info: Option<PartitionInfo>,
        encoded_schema: Vec<u8>,
        engine: String,
        options: HashMap<String, String>,
    ) -> MetaResult<TableId> {
        self.require_leader()?;
        self.admit().await?;
        let coordination = self.coordination(cluster_name)?;
        let meta = self.clusters.get_cluster(cluster_name)?;
        let snapshot = meta.snapshot();

        let procedure = match partition_info {
            Some(info) => Procedure::CreatePartitionTable(CreatePartitionTableProcedure::new(
                &snapshot,
                &self.shard_picker,
                schema_name,
                table_name,
                info,
                encoded_schema,
                engine,
                options,
            )?),
            None => Procedure::CreateTable(
                CreateTableProcedure::new(
                    &snapshot,
                    &self.shard_picker,
                    schema_name,
                    table_name,
                    chosen_shard,
                    encoded_schema,
                    engine,
                    options,
                )?,
            ),
        };
        let handle = coordination.manager.submit(procedure).await?;
        match handle.wait().await {
            ProcedureState::Finished => meta
                .get_table(schema_name, table_name)
                .map(|t| t.id)
                .ok_or_else(|| MetaError::Internal("created table missing from cache".into())),
            state => Err(MetaError::Internal(format!(
                "create table procedure ended {state:?}"
            ))),
        }
    }

    /// Drop a table (partitioned roots cascade to their sub-tables) and
    /// wait for the procedure to terminate.
    pub async fn drop_table(
        &self,
        cluster_name: &str,
        schema_name: &str,
        table_name: &str,
    ) -> MetaResult<()> {
        self.require_leader()?;
        self.admit().await?;
        let coordination = self.coordination(cluster_name)?;
        let meta = self.clusters.get_cluster(cluster_name)?;
        let snapshot = meta.snapshot();

        let table = meta.get_table(schema_name, table_name);
        let procedure = match &table {
            Some(record) if record.is_partitioned() => Procedure::DropPartitionTable(
                DropPartitionTableProcedure::new(&meta, record, schema_name)?,
            ),
            _ => {
                let resolved =
                    DropTableProcedure::resolve(&snapshot, table.as_ref().map(|t| t.id));
                Procedure::DropTable(DropTableProcedure::new(resolved, schema_name, table_name))
            }
        };
        let handle = coordination.manager.submit(procedure).await?;
        match handle.wait().await {
            ProcedureState::Finished => Ok(()),
            state => Err(MetaError::Internal(format!(
                "drop table procedure ended {state:?}"
            ))),
        }
    }

    pub async fn transfer_leader(
        &self,
        cluster_name: &str,
        shard_id: ShardId,
        target_node: &str,
    ) -> MetaResult<()> {
        self.require_leader()?;
        self.admit().await?;
        let coordination = self.coordination(cluster_name)?;
        let meta = self.clusters.get_cluster(cluster_name)?;
        let procedure = TransferLeaderProcedure::new(
            &meta.snapshot(),
            shard_id,
            target_node,
            true,
        )?;
        let handle = coordination
            .manager
            .submit(Procedure::TransferLeader(procedure))
            .await?;
        match handle.wait().await {
            ProcedureState::Finished => Ok(()),
            state => Err(MetaError::Internal(format!(
                "transfer leader procedure ended {state:?}"
            ))),
        }
    }

    pub async fn split(
        &self,
        cluster_name: &str,
        schema_name: &str,
        shard_id: ShardId,
        split_tables: &[String],
        target_node: &str,
    ) -> MetaResult<ShardId> {
        self.require_leader()?;
        self.admit().await?;
        let coordination = self.coordination(cluster_name)?;
        let meta = self.clusters.get_cluster(cluster_name)?;

        let mut moving = Vec::with_capacity(split_tables.len());
        for name in split_tables {
            let table = meta
                .get_table(schema_name, name)
                .ok_or_else(|| MetaError::TableNotFound(format!("{schema_name}/{name}")))?;
            moving.push(table.id);
        }
        let new_shard = meta.alloc_shard_id().await?;
        let procedure =
            match SplitProcedure::new(&meta.snapshot(), shard_id, new_shard, moving, target_node) {
                Ok(p) => p,
                Err(e) => {
                    meta.collect_shard_id(new_shard).await;
                    return Err(e);
                }
            };
        let handle = coordination
            .manager
            .submit(Procedure::Split(procedure))
            .await?;
        match handle.wait().await {
            ProcedureState::Finished => Ok(new_shard),
            state => {
                meta.collect_shard_id(new_shard).await;
                Err(MetaError::Internal(format!(
                    "split procedure ended {state:?}"
                )))
            }
        }
    }

    // ── Affinity & schedule toggles ────────────────────────────────────────

    pub fn list_shard_affinities(&self, cluster_name: &str) -> MetaResult<Vec<ShardAffinityRule>> {
        Ok(self.scheduler(cluster_name)?.affinity().list())
    }

    pub fn add_shard_affinities(
        &self,
        cluster_name: &str,
        rules: Vec<ShardAffinityRule>,
    ) -> MetaResult<()> {
        let scheduler = self.scheduler(cluster_name)?;
        for rule in rules {
            scheduler.affinity().upsert(rule);
        }
        Ok(())
    }

    pub fn remove_shard_affinity(&self, cluster_name: &str, shard_id: ShardId) -> MetaResult<bool> {
        Ok(self.scheduler(cluster_name)?.affinity().remove(shard_id))
    }

    pub fn get_enable_schedule(&self, cluster_name: &str) -> MetaResult<bool> {
        Ok(self.scheduler(cluster_name)?.is_enabled())
    }

    pub fn set_enable_schedule(&self, cluster_name: &str, enable: bool) -> MetaResult<()> {
        self.scheduler(cluster_name)?.set_enabled(enable);
        Ok(())
    }

    // ── Diagnose ───────────────────────────────────────────────────────────

    /// Shards in abnormal condition: placed on an expired node, or not
    /// advertised by their (live) owner.
    pub fn diagnose_shards(&self, cluster_name: &str) -> MetaResult<Vec<DiagnoseShardStatus>> {
        let meta = self.clusters.get_cluster(cluster_name)?;
        let snapshot = meta.snapshot();
        let now = tessera_common::now_ms();
        let timeout = self.config.heartbeat.liveness_timeout_ms;

        let mut out = Vec::new();
        for sn in &snapshot.topology.cluster_view.shard_nodes {
            let alive = snapshot
                .nodes
                .get(&sn.node_name)
                .map(|n| now.saturating_sub(n.last_touch_time) < timeout)
                .unwrap_or(false);
            if !alive {
                out.push(DiagnoseShardStatus {
                    shard_id: sn.shard_id,
                    node_name: sn.node_name.clone(),
                    status: "node_expired".into(),
                });
                continue;
            }
            let advertised = meta
                .node_shard_infos(&sn.node_name)
                .map(|infos| infos.iter().any(|i| i.shard_id == sn.shard_id))
                .unwrap_or(false);
            if !advertised {
                out.push(DiagnoseShardStatus {
                    shard_id: sn.shard_id,
                    node_name: sn.node_name.clone(),
                    status: "not_advertised".into(),
                });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagnoseShardStatus {
    pub shard_id: ShardId,
    pub node_name: String,
    pub status: String,
}
