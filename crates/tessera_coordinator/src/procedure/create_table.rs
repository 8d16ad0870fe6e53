//! CreateTable: place a new table on a shard and open it on the data node.
//!
//! Steps: create the table row (idempotent by name) → CAS the shard view
//! to include the table → dispatch `CreateTableOnShard`. A terminal
//! dispatch rejection after the CAS triggers the compensating drop so no
//! committed placement points at a table the data node refused.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tessera_common::{MetaError, MetaResult, ShardId, TableId};
use tessera_meta::ClusterSnapshot;
use tessera_storage::PartitionInfo;

use crate::dispatch::CreateTableOnShardRequest;
use crate::picker::ShardPicker;
use crate::procedure::{leader_endpoint, table_info, update_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    CreateMeta,
    UpdateView,
    Dispatch,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableProcedure {
    pub schema_name: String,
    pub table_name: String,
    pub shard_id: ShardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_info: Option<PartitionInfo>,
    #[serde(default)]
    pub encoded_schema: Vec<u8>,
    pub engine: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Set once the table row exists.
    pub table_id: Option<TableId>,
    /// Shard view version committed by the CAS step.
    pub committed_version: Option<u64>,
    /// Reason captured when entering rollback.
    pub rollback_reason: Option<String>,
    step: Step,
}

impl CreateTableProcedure {
    /// Decide placement now, from the snapshot: the caller-chosen shard or
    /// the picker's choice.
    pub fn new(
        snapshot: &ClusterSnapshot,
        picker: &dyn ShardPicker,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        chosen_shard: Option<ShardId>,
        encoded_schema: Vec<u8>,
        engine: impl Into<String>,
        options: HashMap<String, String>,
    ) -> MetaResult<Self> {
        let shard_id = match chosen_shard {
            Some(id) => {
                if !snapshot.topology.shard_views.contains_key(&id) {
                    return Err(MetaError::ShardNotFound(id));
                }
                id
            }
            None => picker.pick(snapshot, 1)?[0],
        };
        Ok(Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            shard_id,
            partition_info: None,
            encoded_schema,
            engine: engine.into(),
            options,
            table_id: None,
            committed_version: None,
            rollback_reason: None,
            step: Step::CreateMeta,
        })
    }

    /// Used by the partition-table procedure to pin a sub-table create to
    /// an already-picked shard.
    pub fn with_partition_info(mut self, info: Option<PartitionInfo>) -> Self {
        self.partition_info = info;
        self
    }

    fn require_table_id(&self) -> MetaResult<TableId> {
        self.table_id
            .ok_or_else(|| MetaError::Internal("table id missing in persisted state".into()))
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        match self.step {
            Step::CreateMeta => {
                ctx.meta.get_or_create_schema(&self.schema_name).await?;
                let table = ctx
                    .meta
                    .create_table_metadata(
                        &self.schema_name,
                        &self.table_name,
                        self.partition_info.clone(),
                    )
                    .await?;
                self.table_id = Some(table.id);
                self.step = Step::UpdateView;
                Ok(StepOutcome::Continue)
            }
            Step::UpdateView => {
                let table_id = self.require_table_id()?;
                let version = match ctx.meta.add_table_to_shard(self.shard_id, table_id).await {
                    Ok(v) => v,
                    Err(MetaError::InvalidTopology { reason, .. }) => {
                        // The table landed elsewhere between snapshot and
                        // commit; the precondition no longer holds.
                        return Err(MetaError::StaleSnapshot(reason));
                    }
                    Err(other) => return Err(other),
                };
                self.committed_version = Some(version);
                self.step = Step::Dispatch;
                Ok(StepOutcome::Continue)
            }
            Step::Dispatch => {
                let table_id = self.require_table_id()?;
                let table = ctx
                    .meta
                    .get_table_by_id(table_id)
                    .ok_or_else(|| MetaError::StaleSnapshot(format!("{table_id} vanished")))?;
                let endpoint = leader_endpoint(&ctx.meta, self.shard_id)?;
                let request = CreateTableOnShardRequest {
                    update_shard_info: update_shard_info(&ctx.meta, self.shard_id)?,
                    table_info: table_info(&table, &self.schema_name),
                    encoded_schema: self.encoded_schema.clone(),
                    engine: self.engine.clone(),
                    create_if_not_exist: true,
                    options: self.options.clone(),
                };
                match ctx.dispatch.create_table_on_shard(&endpoint, request).await {
                    Ok(node_version) => {
                        info!(
                            table = %self.table_name,
                            shard = %self.shard_id,
                            node_version,
                            "table created on shard"
                        );
                        Ok(StepOutcome::Finished)
                    }
                    Err(e) if e.is_retryable() => Err(e),
                    Err(e) => {
                        warn!(table = %self.table_name, error = %e, "create dispatch rejected, rolling back");
                        self.rollback_reason = Some(e.to_string());
                        self.step = Step::Rollback;
                        Ok(StepOutcome::Continue)
                    }
                }
            }
            Step::Rollback => {
                // Compensate the committed CAS: take the table back off the
                // shard and delete its row. Both calls are idempotent.
                let table_id = self.require_table_id()?;
                ctx.meta
                    .remove_table_from_shard(self.shard_id, table_id)
                    .await?;
                ctx.meta
                    .drop_table_metadata(&self.schema_name, &self.table_name)
                    .await?;
                Err(MetaError::Internal(format!(
                    "create table {} rolled back: {}",
                    self.table_name,
                    self.rollback_reason.as_deref().unwrap_or("unknown")
                )))
            }
        }
    }
}
