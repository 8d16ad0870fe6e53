//! Multi-cluster registry: creates clusters, loads them from the KV at
//! startup, and hands out `Arc<ClusterMetadata>` handles by name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use tessera_common::{now_ms, ClusterId, MetaError, MetaResult, TopologyType};
use tessera_storage::{keys, ClusterRecord, IdAllocator, MetaStorage};

use crate::metadata::ClusterMetadata;

/// Admin-chosen attributes of a new cluster.
#[derive(Debug, Clone)]
pub struct CreateClusterOpts {
    pub min_node_count: u32,
    pub shard_total: u32,
    pub topology_type: TopologyType,
    pub procedure_executing_batch_size: u32,
}

impl Default for CreateClusterOpts {
    fn default() -> Self {
        Self {
            min_node_count: 1,
            shard_total: 8,
            topology_type: TopologyType::Static,
            procedure_executing_batch_size: 4,
        }
    }
}

pub struct ClusterManager {
    storage: MetaStorage,
    cluster_id_alloc: IdAllocator,
    clusters: RwLock<HashMap<String, Arc<ClusterMetadata>>>,
}

impl ClusterManager {
    pub fn new(storage: MetaStorage) -> Self {
        let cluster_id_alloc = IdAllocator::new(
            storage.kv().clone(),
            keys::alloc_id_key(storage.root(), "cluster"),
            1,
        );
        Self {
            storage,
            cluster_id_alloc,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted cluster into memory. Called once at startup
    /// (and again by a newly elected leader resuming from the KV).
    pub async fn load(&self) -> MetaResult<()> {
        let records = self.storage.list_clusters().await?;
        for record in records {
            let name = record.name.clone();
            if self.clusters.read().contains_key(&name) {
                continue;
            }
            let meta = Arc::new(ClusterMetadata::new(self.storage.clone(), record));
            meta.load().await?;
            self.clusters.write().insert(name.clone(), meta);
            info!(cluster = %name, "cluster loaded");
        }
        Ok(())
    }

    /// Create a cluster with its initial (empty) topology. Fails
    /// `AlreadyExists` on a name collision.
    pub async fn create_cluster(
        &self,
        name: &str,
        opts: CreateClusterOpts,
    ) -> MetaResult<Arc<ClusterMetadata>> {
        if name.is_empty() {
            return Err(MetaError::InvalidArgument("cluster name is empty".into()));
        }
        if opts.shard_total == 0 {
            return Err(MetaError::InvalidArgument("shard_total must be > 0".into()));
        }
        if self.clusters.read().contains_key(name) {
            return Err(MetaError::ClusterAlreadyExists(name.to_string()));
        }

        let id = ClusterId(self.cluster_id_alloc.alloc().await? as u32);
        let record = ClusterRecord {
            id,
            name: name.to_string(),
            min_node_count: opts.min_node_count,
            shard_total: opts.shard_total,
            topology_type: opts.topology_type,
            procedure_executing_batch_size: opts.procedure_executing_batch_size,
            created_at: now_ms(),
            modified_at: now_ms(),
        };
        self.storage.create_cluster(&record).await?;

        let meta = Arc::new(ClusterMetadata::new(self.storage.clone(), record));
        meta.init_topology().await?;
        self.clusters
            .write()
            .insert(name.to_string(), meta.clone());
        info!(cluster = %name, id = %id, "cluster created");
        Ok(meta)
    }

    pub fn get_cluster(&self, name: &str) -> MetaResult<Arc<ClusterMetadata>> {
        self.clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MetaError::ClusterNotFound(name.to_string()))
    }

    pub fn list_clusters(&self) -> Vec<ClusterRecord> {
        let mut out: Vec<ClusterRecord> = self
            .clusters
            .read()
            .values()
            .map(|m| m.cluster())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::MemKv;

    fn manager() -> ClusterManager {
        ClusterManager::new(MetaStorage::new(Arc::new(MemKv::new()), "/tessera"))
    }

    #[tokio::test]
    async fn test_create_and_get_cluster() {
        let m = manager();
        let created = m
            .create_cluster("defaultCluster", CreateClusterOpts::default())
            .await
            .unwrap();
        let got = m.get_cluster("defaultCluster").unwrap();
        assert_eq!(created.cluster_id(), got.cluster_id());
        assert!(m.get_cluster("nope").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let m = manager();
        m.create_cluster("c", CreateClusterOpts::default())
            .await
            .unwrap();
        let err = m
            .create_cluster("c", CreateClusterOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::ClusterAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_invalid_opts_rejected() {
        let m = manager();
        assert!(m
            .create_cluster("", CreateClusterOpts::default())
            .await
            .is_err());
        let opts = CreateClusterOpts {
            shard_total: 0,
            ..Default::default()
        };
        assert!(m.create_cluster("c", opts).await.is_err());
    }

    #[tokio::test]
    async fn test_load_restores_clusters() {
        let storage = MetaStorage::new(Arc::new(MemKv::new()), "/tessera");
        let m = ClusterManager::new(storage.clone());
        m.create_cluster("a", CreateClusterOpts::default())
            .await
            .unwrap();
        m.create_cluster("b", CreateClusterOpts::default())
            .await
            .unwrap();

        let m2 = ClusterManager::new(storage);
        m2.load().await.unwrap();
        assert_eq!(m2.list_clusters().len(), 2);
        assert!(m2.get_cluster("a").is_ok());
        assert!(m2.get_cluster("b").is_ok());
    }
}
