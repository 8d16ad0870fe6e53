//! Shared fixture for coordinator integration tests: one cluster over an
//! in-memory KV with a recording mock dispatch.
#![allow(dead_code)]

use std::sync::Arc;

use tessera_common::config::{HeartbeatConfig, ProcedureConfig, SchedulerConfig};
use tessera_common::now_ms;
use tessera_coordinator::procedure::ProcedureManager;
use tessera_coordinator::{MockEventDispatch, Scheduler};
use tessera_meta::ClusterMetadata;
use tessera_storage::{ClusterRecord, MemKv, MetaStorage, NodeStats};

pub struct TestCluster {
    pub kv: Arc<MemKv>,
    pub meta: Arc<ClusterMetadata>,
    pub dispatch: Arc<MockEventDispatch>,
    pub manager: Arc<ProcedureManager>,
    pub scheduler: Arc<Scheduler>,
}

pub async fn test_cluster(min_node_count: u32, shard_total: u32) -> TestCluster {
    test_cluster_with(min_node_count, shard_total, tessera_common::TopologyType::Static).await
}

pub async fn test_cluster_with(
    min_node_count: u32,
    shard_total: u32,
    topology_type: tessera_common::TopologyType,
) -> TestCluster {
    let kv = Arc::new(MemKv::new());
    let storage = MetaStorage::new(kv.clone(), "/tessera");
    let record = ClusterRecord {
        id: tessera_common::ClusterId(1),
        name: "defaultCluster".into(),
        min_node_count,
        shard_total,
        topology_type,
        procedure_executing_batch_size: 4,
        created_at: now_ms(),
        modified_at: now_ms(),
    };
    storage.create_cluster(&record).await.unwrap();
    let meta = Arc::new(ClusterMetadata::new(storage, record));
    meta.init_topology().await.unwrap();

    let dispatch = MockEventDispatch::new();
    let manager = ProcedureManager::new(
        meta.clone(),
        dispatch.clone(),
        ProcedureConfig {
            retry_backoff_ms: 5,
            retry_backoff_cap_ms: 20,
            ..ProcedureConfig::default()
        },
    );
    let scheduler = Scheduler::new(
        meta.clone(),
        manager.clone(),
        SchedulerConfig {
            tick_interval_ms: 50,
            ..SchedulerConfig::default()
        },
        HeartbeatConfig {
            liveness_timeout_ms: 60_000,
            ..HeartbeatConfig::default()
        },
    );
    TestCluster {
        kv,
        meta,
        dispatch,
        manager,
        scheduler,
    }
}

impl TestCluster {
    pub async fn register_node(&self, name: &str) {
        self.meta
            .register_node(name, NodeStats::default(), vec![])
            .await
            .unwrap();
    }

    /// Heartbeat with exactly the shards the cluster view assigns to the
    /// node, as a healthy data node would after opening them.
    pub async fn advertise_owned(&self, node: &str) {
        let snapshot = self.meta.snapshot();
        let infos: Vec<tessera_meta::ShardInfo> = snapshot
            .topology
            .cluster_view
            .shard_nodes
            .iter()
            .filter(|sn| sn.node_name == node)
            .map(|sn| tessera_meta::ShardInfo {
                shard_id: sn.shard_id,
                role: sn.role,
                version: snapshot
                    .topology
                    .shard_views
                    .get(&sn.shard_id)
                    .map(|v| v.version)
                    .unwrap_or(0),
                status: tessera_common::ShardStatus::Ready,
            })
            .collect();
        self.meta
            .register_node(node, NodeStats::default(), infos)
            .await
            .unwrap();
    }

    /// Rebuild the coordination stack over the same KV, as a restarted
    /// (or newly elected) coordinator would.
    pub async fn restart(&self) -> TestCluster {
        let storage = MetaStorage::new(self.kv.clone(), "/tessera");
        let meta = Arc::new(ClusterMetadata::new(storage, self.meta.cluster()));
        meta.load().await.unwrap();
        let dispatch = MockEventDispatch::new();
        let manager = ProcedureManager::new(
            meta.clone(),
            dispatch.clone(),
            ProcedureConfig {
                retry_backoff_ms: 5,
                retry_backoff_cap_ms: 20,
                ..ProcedureConfig::default()
            },
        );
        let scheduler = Scheduler::new(
            meta.clone(),
            manager.clone(),
            SchedulerConfig::default(),
            HeartbeatConfig::default(),
        );
        TestCluster {
            kv: self.kv.clone(),
            meta,
            dispatch,
            manager,
            scheduler,
        }
    }
}
