//! Monotonic ID allocation backed by the KV.
//!
//! The allocator leases a batch of IDs at a time: when the in-memory range
//! runs dry it CASes `end += step` on `/<root>/alloc_id/<scope>` and hands
//! out the fresh range without further KV traffic. The range-extension CAS
//! is the only KV write; a lost race simply re-reads and retries.
//!
//! IDs leaked by a crash between lease and use are never reclaimed — gaps
//! are acceptable everywhere the plain allocator is used. The reusable
//! variant additionally hands out externally collected IDs before touching
//! the range; it must never back TableID or SchemaID allocation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use tessera_common::{MetaError, MetaResult};

use crate::kv::{KvBackend, TxnGuard, TxnOp};

/// Default number of IDs leased per range extension.
pub const DEFAULT_ALLOC_STEP: u64 = 20;

struct Range {
    next: u64,
    end: u64,
}

/// Allocates dense, monotonically increasing 64-bit IDs for one scope.
pub struct IdAllocator {
    kv: Arc<dyn KvBackend>,
    key: String,
    step: u64,
    range: Mutex<Range>,
}

impl IdAllocator {
    pub fn new(kv: Arc<dyn KvBackend>, key: impl Into<String>, step: u64) -> Self {
        assert!(step > 0, "alloc step must be positive");
        Self {
            kv,
            key: key.into(),
            step,
            range: Mutex::new(Range { next: 0, end: 0 }),
        }
    }

    /// Allocate one ID. Extends the leased range via CAS when exhausted.
    pub async fn alloc(&self) -> MetaResult<u64> {
        let mut range = self.range.lock().await;
        if range.next >= range.end {
            let (start, end) = self.extend_range().await?;
            range.next = start;
            range.end = end;
        }
        let id = range.next;
        range.next += 1;
        Ok(id)
    }

    /// CAS `end += step` on the scope key, retrying on lost races.
    async fn extend_range(&self) -> MetaResult<(u64, u64)> {
        loop {
            let current = self.kv.get(&self.key).await?;
            let (cur_end, revision) = match &current {
                Some(kv) => (decode_end(&kv.value)?, kv.mod_revision),
                None => (0, 0),
            };
            let new_end = cur_end + self.step;
            let result = self
                .kv
                .txn(
                    vec![TxnGuard {
                        key: self.key.clone(),
                        revision,
                    }],
                    vec![TxnOp::Put {
                        key: self.key.clone(),
                        value: new_end.to_string().into_bytes(),
                    }],
                )
                .await;
            match result {
                Ok(()) => {
                    debug!(key = %self.key, start = cur_end, end = new_end, "extended id range");
                    return Ok((cur_end, new_end));
                }
                Err(MetaError::VersionConflict { .. }) => continue,
                Err(other) => {
                    return Err(MetaError::AllocId {
                        scope: self.key.clone(),
                        reason: other.to_string(),
                    })
                }
            }
        }
    }
}

fn decode_end(bytes: &[u8]) -> MetaResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MetaError::Codec("alloc_id value is not a u64".into()))
}

/// An allocator that hands out externally collected IDs before extending
/// the backing range. Safe only where ID reuse is safe (shard IDs).
pub struct ReusableIdAllocator {
    collected: Mutex<BTreeSet<u64>>,
    inner: IdAllocator,
}

impl ReusableIdAllocator {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        key: impl Into<String>,
        step: u64,
        collected: Vec<u64>,
    ) -> Self {
        Self {
            collected: Mutex::new(collected.into_iter().collect()),
            inner: IdAllocator::new(kv, key, step),
        }
    }

    /// Allocate the smallest collected ID, falling back to the range.
    pub async fn alloc(&self) -> MetaResult<u64> {
        let mut collected = self.collected.lock().await;
        if let Some(&id) = collected.iter().next() {
            collected.remove(&id);
            return Ok(id);
        }
        drop(collected);
        self.inner.alloc().await
    }

    /// Return an ID to the pool.
    pub async fn collect(&self, id: u64) {
        self.collected.lock().await.insert(id);
    }
}
