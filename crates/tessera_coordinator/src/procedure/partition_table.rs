//! Partitioned-table lifecycle.
//!
//! Create: the root table (carrying `PartitionInfo`) lands on one shard,
//! then one sub-table per partition lands on shards chosen by the shard
//! picker. Per-sub-table progress is recorded so resume skips completed
//! partitions. Drop removes every sub-table and then the root.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{MetaError, MetaResult, ShardId};
use tessera_meta::ClusterSnapshot;
use tessera_storage::PartitionInfo;

use crate::dispatch::{CreateTableOnShardRequest, DropTableOnShardRequest};
use crate::picker::ShardPicker;
use crate::procedure::{leader_endpoint, table_info, update_shard_info, ProcedureCtx, StepOutcome};

/// `<root>_<index>`, the fixed naming scheme of sub-tables.
pub fn sub_table_name(root: &str, index: u32) -> String {
    format!("{root}_{index}")
}

// ── Create ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CreateStep {
    CreateRoot,
    CreateSubTables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePartitionTableProcedure {
    pub schema_name: String,
    pub table_name: String,
    pub partition_info: PartitionInfo,
    pub encoded_schema: Vec<u8>,
    pub engine: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Shard hosting the root table.
    pub root_shard: ShardId,
    /// One target shard per sub-table, picked at construction.
    pub sub_shards: Vec<ShardId>,
    /// Whether the root table is fully created.
    pub root_done: bool,
    /// Per-sub-table completion, same order as `sub_shards`.
    pub sub_done: Vec<bool>,
    step: CreateStep,
}

impl CreatePartitionTableProcedure {
    pub fn new(
        snapshot: &ClusterSnapshot,
        picker: &dyn ShardPicker,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        partition_info: PartitionInfo,
        encoded_schema: Vec<u8>,
        engine: impl Into<String>,
        options: HashMap<String, String>,
    ) -> MetaResult<Self> {
        if partition_info.partition_num == 0 {
            return Err(MetaError::InvalidArgument(
                "partition_num must be > 0".into(),
            ));
        }
        let n = partition_info.partition_num as usize;
        let mut picks = picker.pick(snapshot, n + 1)?;
        let root_shard = picks.remove(0);
        Ok(Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            partition_info,
            encoded_schema,
            engine: engine.into(),
            options,
            root_shard,
            sub_shards: picks,
            root_done: false,
            sub_done: vec![false; n],
            step: CreateStep::CreateRoot,
        })
    }

    /// Create one table end to end: row, shard view CAS, dispatch. Every
    /// effect is idempotent, so replaying after a crash is safe.
    async fn create_one(
        &self,
        ctx: &ProcedureCtx,
        name: &str,
        shard_id: ShardId,
        partition_info: Option<PartitionInfo>,
    ) -> MetaResult<()> {
        let table = ctx
            .meta
            .create_table_metadata(&self.schema_name, name, partition_info)
            .await?;
        ctx.meta.add_table_to_shard(shard_id, table.id).await?;
        let endpoint = leader_endpoint(&ctx.meta, shard_id)?;
        let request = CreateTableOnShardRequest {
            update_shard_info: update_shard_info(&ctx.meta, shard_id)?,
            table_info: table_info(&table, &self.schema_name),
            encoded_schema: self.encoded_schema.clone(),
            engine: self.engine.clone(),
            create_if_not_exist: true,
            options: self.options.clone(),
        };
        ctx.dispatch.create_table_on_shard(&endpoint, request).await?;
        Ok(())
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self.step {
            CreateStep::CreateRoot => {
                ctx.meta.get_or_create_schema(&self.schema_name).await?;
                if !self.root_done {
                    self.create_one(
                        ctx,
                        &self.table_name.clone(),
                        self.root_shard,
                        Some(self.partition_info.clone()),
                    )
                    .await?;
                    self.root_done = true;
                }
                self.step = CreateStep::CreateSubTables;
                Ok(StepOutcome::Continue)
            }
            CreateStep::CreateSubTables => {
                for i in 0..self.sub_shards.len() {
                    if self.sub_done[i] {
                        continue;
                    }
                    let name = sub_table_name(&self.table_name, i as u32);
                    self.create_one(ctx, &name, self.sub_shards[i], None).await?;
                    self.sub_done[i] = true;
                }
                info!(
                    table = %self.table_name,
                    partitions = self.sub_shards.len(),
                    "partitioned table created"
                );
                Ok(StepOutcome::Finished)
            }
        }
    }
}

// ── Drop ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropPartitionTableProcedure {
    pub schema_name: String,
    pub table_name: String,
    /// Sub-table names plus the root, drop order; resolved at construction.
    pub drop_order: Vec<String>,
    /// Shard of each table in `drop_order` at construction time.
    pub table_shards: Vec<ShardId>,
    /// Per-table completion.
    pub done: Vec<bool>,
}

impl DropPartitionTableProcedure {
    pub fn new(
        meta: &tessera_meta::ClusterMetadata,
        root: &tessera_storage::TableRecord,
        schema_name: impl Into<String>,
    ) -> MetaResult<Self> {
        let schema_name = schema_name.into();
        let info = root.partition_info.as_ref().ok_or_else(|| {
            MetaError::InvalidArgument(format!("{} is not a partitioned table", root.name))
        })?;

        // Sub-tables first, root last, so a partial drop never leaves
        // orphaned sub-tables behind a deleted root.
        let mut drop_order: Vec<String> = (0..info.partition_num)
            .map(|i| sub_table_name(&root.name, i))
            .collect();
        drop_order.push(root.name.clone());

        // Shards hosting any of the tables, for entry locking.
        let snapshot = meta.snapshot();
        let ids: Vec<_> = drop_order
            .iter()
            .filter_map(|name| meta.get_table(&schema_name, name))
            .map(|t| t.id)
            .collect();
        let mut table_shards: Vec<ShardId> = snapshot
            .topology
            .shard_views
            .values()
            .filter(|v| v.table_ids.iter().any(|id| ids.contains(id)))
            .map(|v| v.shard_id)
            .collect();
        table_shards.sort_unstable();
        table_shards.dedup();

        Ok(Self {
            schema_name,
            table_name: root.name.clone(),
            done: vec![false; drop_order.len()],
            table_shards,
            drop_order,
        })
    }

    /// Drop one table end to end, tolerating partial prior progress.
    async fn drop_one(&self, ctx: &ProcedureCtx, name: &str) -> MetaResult<()> {
        let Some(table) = ctx.meta.get_table(&self.schema_name, name) else {
            return Ok(());
        };
        let shard = ctx
            .meta
            .snapshot()
            .topology
            .shard_views
            .values()
            .find(|v| v.table_ids.contains(&table.id))
            .map(|v| v.shard_id);

        if let Some(shard_id) = shard {
            ctx.meta.remove_table_from_shard(shard_id, table.id).await?;
            if let Ok(endpoint) = leader_endpoint(&ctx.meta, shard_id) {
                let request = DropTableOnShardRequest {
                    update_shard_info: update_shard_info(&ctx.meta, shard_id)?,
                    table_info: table_info(&table, &self.schema_name),
                };
                ctx.dispatch.drop_table_on_shard(&endpoint, request).await?;
            }
        }
        ctx.meta
            .drop_table_metadata(&self.schema_name, name)
            .await?;
        Ok(())
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        for i in 0..self.drop_order.len() {
            if self.done[i] {
                continue;
            }
            let name = self.drop_order[i].clone();
            self.drop_one(ctx, &name).await?;
            self.done[i] = true;
        }
        info!(table = %self.table_name, "partitioned table dropped");
        Ok(StepOutcome::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_table_names() {
        assert_eq!(sub_table_name("metrics", 0), "metrics_0");
        assert_eq!(sub_table_name("metrics", 11), "metrics_11");
    }
}
