//! The procedure executor: persistence, concurrency gating, retries, and
//! crash recovery.
//!
//! `Submit` persists the procedure's meta (`Init`) before anything runs.
//! Each procedure then executes on its own task, gated by a semaphore
//! sized to the cluster's `procedure_executing_batch_size` and by the
//! entry lock over its related shards. The raw state is persisted after
//! every step attempt — also failed ones — so per-target fan-out progress
//! survives a crash mid-step.
//!
//! Retry policy: CAS conflicts re-read a bounded number of times before
//! failing as a stale snapshot; transient transport errors back off
//! exponentially up to a retry ceiling; everything else is terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use tessera_common::config::ProcedureConfig;
use tessera_common::{now_ms, MetaError, MetaResult, ProcedureId, ShutdownSignal};
use tessera_meta::ClusterMetadata;
use tessera_storage::{
    IdAllocator, MetaStorage, ProcedureRecord, ProcedureState,
};

use crate::dispatch::EventDispatch;
use crate::lock::EntryLock;
use crate::procedure::{Procedure, ProcedureCtx, ProcedureKind, StepOutcome};

/// Immutable description of a submitted procedure.
#[derive(Debug, Clone)]
pub struct ProcedureInfo {
    pub id: ProcedureId,
    pub kind: ProcedureKind,
    pub state: ProcedureState,
}

/// Completion handle returned by `submit`.
pub struct ProcedureHandle {
    pub id: ProcedureId,
    done: watch::Receiver<Option<ProcedureState>>,
}

impl ProcedureHandle {
    /// Wait for the terminal state.
    pub async fn wait(mut self) -> ProcedureState {
        loop {
            if let Some(state) = *self.done.borrow() {
                return state;
            }
            if self.done.changed().await.is_err() {
                // Executor dropped without publishing; treat as failed.
                return ProcedureState::Failed;
            }
        }
    }
}

pub struct ProcedureManager {
    meta: Arc<ClusterMetadata>,
    dispatch: Arc<dyn EventDispatch>,
    storage: MetaStorage,
    config: ProcedureConfig,
    entry_lock: Arc<EntryLock>,
    id_alloc: IdAllocator,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<ProcedureId, ProcedureInfo>>,
    cancel_flags: DashMap<ProcedureId, Arc<AtomicBool>>,
    shutdown: ShutdownSignal,
}

impl ProcedureManager {
    pub fn new(
        meta: Arc<ClusterMetadata>,
        dispatch: Arc<dyn EventDispatch>,
        config: ProcedureConfig,
    ) -> Arc<Self> {
        let storage = meta.storage().clone();
        let batch = meta.cluster().procedure_executing_batch_size.max(1) as usize;
        let id_alloc = IdAllocator::new(
            storage.kv().clone(),
            tessera_storage::keys::alloc_id_key(
                storage.root(),
                &format!("procedure/{}", meta.cluster_id().0),
            ),
            tessera_storage::DEFAULT_ALLOC_STEP,
        );
        Arc::new(Self {
            meta,
            dispatch,
            storage,
            config,
            entry_lock: Arc::new(EntryLock::new()),
            id_alloc,
            semaphore: Arc::new(Semaphore::new(batch)),
            running: Mutex::new(HashMap::new()),
            cancel_flags: DashMap::new(),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn entry_lock(&self) -> &EntryLock {
        &self.entry_lock
    }

    /// Persist the meta, then run the procedure asynchronously.
    pub async fn submit(self: &Arc<Self>, procedure: Procedure) -> MetaResult<ProcedureHandle> {
        let id = ProcedureId(self.id_alloc.alloc().await?);
        let record = ProcedureRecord {
            id,
            kind: procedure.kind().as_str().to_string(),
            state: ProcedureState::Init,
            cluster_id: self.meta.cluster_id(),
            raw_state: procedure.raw_state()?,
            created_at: now_ms(),
            modified_at: now_ms(),
        };
        self.storage.save_procedure(&record).await?;
        metrics::counter!("tessera_procedure_submitted_total", "kind" => procedure.kind().as_str())
            .increment(1);
        Ok(self.spawn(record, procedure))
    }

    /// Resume every unfinished procedure from its persisted state. Called
    /// by a newly elected leader before it serves writes.
    pub async fn restore(self: &Arc<Self>) -> MetaResult<usize> {
        let records = self.storage.list_unfinished_procedures().await?;
        let mut resumed = 0;
        for record in records {
            if record.cluster_id != self.meta.cluster_id() {
                continue;
            }
            match Procedure::from_raw_state(record.raw_state.clone()) {
                Ok(procedure) => {
                    info!(id = %record.id, kind = %record.kind, "resuming procedure");
                    self.spawn(record, procedure);
                    resumed += 1;
                }
                Err(e) => {
                    // Unknown or corrupt state cannot be re-driven; park it
                    // as failed rather than wedging recovery.
                    error!(id = %record.id, kind = %record.kind, error = %e, "cannot resume procedure");
                    let mut failed = record;
                    failed.state = ProcedureState::Failed;
                    self.storage.save_procedure(&failed).await?;
                }
            }
        }
        Ok(resumed)
    }

    pub fn list_running(&self) -> Vec<ProcedureInfo> {
        let mut out: Vec<ProcedureInfo> = self.running.lock().values().cloned().collect();
        out.sort_by_key(|p| p.id);
        out
    }

    /// Request cancellation; takes effect at the next step boundary.
    pub fn cancel(&self, id: ProcedureId) -> bool {
        match self.cancel_flags.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stop accepting step work; running procedures exit at their next
    /// boundary and resume after restart from persisted state.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    fn spawn(self: &Arc<Self>, record: ProcedureRecord, procedure: Procedure) -> ProcedureHandle {
        let id = record.id;
        let (tx, rx) = watch::channel(None);
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(id, cancel.clone());
        self.running.lock().insert(
            id,
            ProcedureInfo {
                id,
                kind: procedure.kind(),
                state: ProcedureState::Init,
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            let state = manager.run(record, procedure, cancel).await;
            manager.running.lock().remove(&id);
            manager.cancel_flags.remove(&id);
            let _ = tx.send(Some(state));
        });
        ProcedureHandle { id, done: rx }
    }

    async fn run(
        self: &Arc<Self>,
        mut record: ProcedureRecord,
        mut procedure: Procedure,
        cancel: Arc<AtomicBool>,
    ) -> ProcedureState {
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return ProcedureState::Cancelled;
        };

        let entries = procedure.related_shards();
        while !self.entry_lock.try_lock(&entries) {
            if self.shutdown.wait_timeout(Duration::from_millis(20)).await {
                return ProcedureState::Cancelled;
            }
            if cancel.load(Ordering::SeqCst) {
                let state = ProcedureState::Cancelled;
                self.persist_state(&mut record, &procedure, state).await;
                return state;
            }
        }

        let state = self.drive(&mut record, &mut procedure, &cancel).await;
        self.entry_lock.unlock(&entries);
        metrics::counter!(
            "tessera_procedure_finished_total",
            "kind" => procedure.kind().as_str(),
            "state" => format!("{state:?}")
        )
        .increment(1);
        state
    }

    async fn drive(
        self: &Arc<Self>,
        record: &mut ProcedureRecord,
        procedure: &mut Procedure,
        cancel: &AtomicBool,
    ) -> ProcedureState {
        let ctx = ProcedureCtx {
            meta: self.meta.clone(),
            dispatch: self.dispatch.clone(),
        };
        self.persist_state(record, procedure, ProcedureState::Running)
            .await;

        let mut conflict_rereads = 0u32;
        let mut step_retries = 0u32;
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let backoff_cap = Duration::from_millis(self.config.retry_backoff_cap_ms);

        loop {
            if cancel.load(Ordering::SeqCst) || self.shutdown.is_shutdown() {
                let state = if cancel.load(Ordering::SeqCst) {
                    ProcedureState::Cancelled
                } else {
                    // Shutdown: stay Running so a restart resumes the work.
                    ProcedureState::Running
                };
                if state == ProcedureState::Cancelled {
                    self.persist_state(record, procedure, state).await;
                }
                return state;
            }

            let result = procedure.step(&ctx).await;
            // Persist progress even on error: fan-out steps record
            // per-target completion that must survive a crash.
            self.persist_state(record, procedure, ProcedureState::Running)
                .await;

            match result {
                Ok(StepOutcome::Continue) => {
                    conflict_rereads = 0;
                    step_retries = 0;
                    backoff = Duration::from_millis(self.config.retry_backoff_ms);
                }
                Ok(StepOutcome::Finished) => {
                    self.persist_state(record, procedure, ProcedureState::Finished)
                        .await;
                    info!(id = %record.id, kind = %record.kind, "procedure finished");
                    return ProcedureState::Finished;
                }
                Err(MetaError::VersionConflict { key, .. }) => {
                    conflict_rereads += 1;
                    if conflict_rereads > self.config.max_conflict_rereads {
                        warn!(
                            id = %record.id,
                            kind = %record.kind,
                            key,
                            "procedure failed: snapshot stale after repeated conflicts"
                        );
                        self.persist_state(record, procedure, ProcedureState::Failed)
                            .await;
                        return ProcedureState::Failed;
                    }
                    // The metadata layer refreshed its cache on conflict;
                    // re-running the step re-reads and re-evaluates.
                }
                Err(e) if e.is_retryable() => {
                    step_retries += 1;
                    if step_retries > self.config.max_step_retries {
                        warn!(id = %record.id, kind = %record.kind, error = %e, "procedure failed: retries exhausted");
                        self.persist_state(record, procedure, ProcedureState::Failed)
                            .await;
                        return ProcedureState::Failed;
                    }
                    if self.shutdown.wait_timeout(backoff).await {
                        return ProcedureState::Running;
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(e) => {
                    warn!(id = %record.id, kind = %record.kind, error = %e, "procedure failed");
                    self.persist_state(record, procedure, ProcedureState::Failed)
                        .await;
                    return ProcedureState::Failed;
                }
            }
        }
    }

    /// Persist meta + raw state, best effort with one retry: losing a
    /// persist means recovery replays the last persisted step, which every
    /// step tolerates.
    async fn persist_state(
        &self,
        record: &mut ProcedureRecord,
        procedure: &Procedure,
        state: ProcedureState,
    ) {
        record.state = state;
        if let Ok(raw) = procedure.raw_state() {
            record.raw_state = raw;
        }
        for attempt in 0..2 {
            match self.storage.save_procedure(record).await {
                Ok(()) => break,
                Err(e) if attempt == 0 => {
                    warn!(id = %record.id, error = %e, "procedure persist failed, retrying");
                }
                Err(e) => {
                    error!(id = %record.id, error = %e, "procedure persist failed");
                }
            }
        }
        if let Some(info) = self.running.lock().get_mut(&record.id) {
            info.state = state;
        }
    }
}
