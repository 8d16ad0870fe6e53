//! DropTable: CAS the table off its shard, drop it on the data node, then
//! delete the table row. Dropping a name that no longer exists finishes
//! immediately — drop is idempotent by name.

use serde::{Deserialize, Serialize};
use tracing::info;

use tessera_common::{MetaError, MetaResult, ShardId, TableId};
use tessera_meta::ClusterSnapshot;

use crate::dispatch::DropTableOnShardRequest;
use crate::procedure::{leader_endpoint, table_info, update_shard_info, ProcedureCtx, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    UpdateView,
    Dispatch,
    DeleteMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTableProcedure {
    pub schema_name: String,
    pub table_name: String,
    /// Resolved at construction; `None` when the table was already gone.
    pub table_id: Option<TableId>,
    /// The shard hosting the table at construction time, if any.
    pub shard_id: Option<ShardId>,
    step: Step,
}

impl DropTableProcedure {
    pub fn new(
        meta_table: Option<(TableId, Option<ShardId>)>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        let (table_id, shard_id) = match meta_table {
            Some((id, shard)) => (Some(id), shard),
            None => (None, None),
        };
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            table_id,
            shard_id,
            step: Step::UpdateView,
        }
    }

    /// Resolve the table and its shard from a snapshot, for constructing.
    pub fn resolve(
        snapshot: &ClusterSnapshot,
        table_id: Option<TableId>,
    ) -> Option<(TableId, Option<ShardId>)> {
        let id = table_id?;
        let shard = snapshot
            .topology
            .shard_views
            .values()
            .find(|v| v.table_ids.contains(&id))
            .map(|v| v.shard_id);
        Some((id, shard))
    }

    pub async fn step(&mut self, ctx: &ProcedureCtx) -> MetaResult<StepOutcome> {
        let Some(table_id) = self.table_id else {
            // Nothing to drop; repeating the drop is a success.
            info!(table = %self.table_name, "drop of absent table is a no-op");
            return Ok(StepOutcome::Finished);
        };

        match self.step {
            Step::UpdateView => {
                if let Some(shard_id) = self.shard_id {
                    ctx.meta.remove_table_from_shard(shard_id, table_id).await?;
                }
                self.step = Step::Dispatch;
                Ok(StepOutcome::Continue)
            }
            Step::Dispatch => {
                let Some(shard_id) = self.shard_id else {
                    self.step = Step::DeleteMeta;
                    return Ok(StepOutcome::Continue);
                };
                // The shard may have lost its leader since the snapshot;
                // the row still has to go, so an unplaced shard skips the
                // dispatch rather than wedging the drop.
                match leader_endpoint(&ctx.meta, shard_id) {
                    Ok(endpoint) => {
                        let table = ctx.meta.get_table(&self.schema_name, &self.table_name);
                        if let Some(table) = table {
                            let request = DropTableOnShardRequest {
                                update_shard_info: update_shard_info(&ctx.meta, shard_id)?,
                                table_info: table_info(&table, &self.schema_name),
                            };
                            let node_version = ctx
                                .dispatch
                                .drop_table_on_shard(&endpoint, request)
                                .await?;
                            info!(
                                table = %self.table_name,
                                shard = %shard_id,
                                node_version,
                                "table dropped on shard"
                            );
                        }
                    }
                    Err(MetaError::StaleSnapshot(_)) => {}
                    Err(other) => return Err(other),
                }
                self.step = Step::DeleteMeta;
                Ok(StepOutcome::Continue)
            }
            Step::DeleteMeta => {
                ctx.meta
                    .drop_table_metadata(&self.schema_name, &self.table_name)
                    .await?;
                Ok(StepOutcome::Finished)
            }
        }
    }
}
