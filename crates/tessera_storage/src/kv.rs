//! Adapter over a linearizable key-value store.
//!
//! The service only ever needs a narrow slice of an etcd-like API: point
//! get/put/delete, prefix scans with pagination, multi-key transactions
//! guarded by per-key revisions, and leases for liveness-bound keys (the
//! leader key). `KvBackend` is that slice; `MemKv` is the embedded
//! implementation used by a single-member deployment and by every test.
//!
//! # Revisions
//!
//! Every successful write bumps a store-wide revision counter and stamps
//! the written key with it (`mod_revision`). Transaction guards compare
//! against `mod_revision`; guard revision 0 means "key must not exist".

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use tessera_common::{MetaError, MetaResult};

/// Upper bound on keys returned by one scan page regardless of the
/// caller-requested limit.
pub const MAX_SCAN_LIMIT: usize = 100;

/// Upper bound on operations in one transaction. Callers writing more keys
/// must split the batch.
pub const MAX_OPS_PER_TXN: usize = 32;

/// A key with its value and the revision of its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// One page of a prefix scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub kvs: Vec<KeyValue>,
    /// True when more keys remain after the last returned one.
    pub more: bool,
}

/// Guard of a transaction: the key's `mod_revision` must equal `revision`
/// (0 = the key must be absent) or the whole transaction fails `Conflict`.
#[derive(Debug, Clone)]
pub struct TxnGuard {
    pub key: String,
    pub revision: u64,
}

/// Mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
    },
    /// Put bound to a lease; the key vanishes when the lease does. Used by
    /// leader election to make grant-and-claim a single atomic decision.
    PutWithLease {
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
    },
    Delete {
        key: String,
    },
}

/// Handle of a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// The slice of a linearizable KV the metadata service depends on.
///
/// Implementations must fail with `MetaError::VersionConflict` when a txn
/// guard mismatches and `MetaError::Unavailable` on transport errors (the
/// caller owns retry policy).
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> MetaResult<Option<KeyValue>>;

    /// Unconditional write. Returns the new `mod_revision`.
    async fn put(&self, key: &str, value: Vec<u8>) -> MetaResult<u64>;

    /// Write a key attached to a lease; the key is deleted when the lease
    /// expires or is revoked.
    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> MetaResult<u64>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> MetaResult<bool>;

    /// Scan keys under `prefix`, strictly after `start_after` when given,
    /// returning at most `min(limit, MAX_SCAN_LIMIT)` entries in key order.
    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> MetaResult<ScanPage>;

    /// All-or-nothing transaction: every guard must hold, then every op
    /// applies atomically.
    async fn txn(&self, guards: Vec<TxnGuard>, ops: Vec<TxnOp>) -> MetaResult<()>;

    async fn grant_lease(&self, ttl: Duration) -> MetaResult<LeaseId>;

    /// Refresh a lease. Returns false when the lease no longer exists (it
    /// expired and its keys are gone).
    async fn keep_alive(&self, lease: LeaseId) -> MetaResult<bool>;

    /// Drop a lease and delete its attached keys.
    async fn revoke_lease(&self, lease: LeaseId) -> MetaResult<()>;
}

/// Fetch every key under a prefix, following pagination.
pub async fn list_all(kv: &dyn KvBackend, prefix: &str) -> MetaResult<Vec<KeyValue>> {
    let mut out = Vec::new();
    let mut start_after: Option<String> = None;
    loop {
        let page = kv.list(prefix, start_after.as_deref(), MAX_SCAN_LIMIT).await?;
        let last = page.kvs.last().map(|kv| kv.key.clone());
        out.extend(page.kvs);
        if !page.more {
            return Ok(out);
        }
        start_after = last;
    }
}

// ── In-memory backend ───────────────────────────────────────────────────────

struct Entry {
    value: Vec<u8>,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct MemKvInner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: u64,
    next_lease: u64,
}

/// Embedded linearizable KV. A single mutex serializes every operation,
/// which is exactly the linearizability contract the callers assume.
pub struct MemKv {
    inner: Mutex<MemKvInner>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemKvInner {
                data: BTreeMap::new(),
                leases: HashMap::new(),
                revision: 0,
                next_lease: 1,
            }),
        }
    }

    /// Drop leases whose TTL elapsed, deleting their attached keys.
    fn expire_due_leases(inner: &mut MemKvInner, now: Instant) {
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = inner.leases.remove(&id) {
                for key in lease.keys {
                    inner.data.remove(&key);
                }
            }
        }
    }

    fn check_guards(inner: &MemKvInner, guards: &[TxnGuard]) -> MetaResult<()> {
        for guard in guards {
            let found = inner
                .data
                .get(&guard.key)
                .map(|e| e.mod_revision)
                .unwrap_or(0);
            if found != guard.revision {
                return Err(MetaError::VersionConflict {
                    key: guard.key.clone(),
                    expected: guard.revision,
                    found,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemKv {
    async fn get(&self, key: &str) -> MetaResult<Option<KeyValue>> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        Ok(inner.data.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            mod_revision: e.mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> MetaResult<u64> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        inner.revision += 1;
        let rev = inner.revision;
        inner.data.insert(
            key.to_string(),
            Entry {
                value,
                mod_revision: rev,
                lease: None,
            },
        );
        Ok(rev)
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> MetaResult<u64> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        if !inner.leases.contains_key(&lease) {
            return Err(MetaError::InvalidArgument(format!(
                "lease {} does not exist",
                lease.0
            )));
        }
        inner.revision += 1;
        let rev = inner.revision;
        inner.data.insert(
            key.to_string(),
            Entry {
                value,
                mod_revision: rev,
                lease: Some(lease),
            },
        );
        if let Some(l) = inner.leases.get_mut(&lease) {
            l.keys.insert(key.to_string());
        }
        Ok(rev)
    }

    async fn delete(&self, key: &str) -> MetaResult<bool> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        let removed = inner.data.remove(key);
        if let Some(entry) = &removed {
            if let Some(lease) = entry.lease {
                if let Some(l) = inner.leases.get_mut(&lease) {
                    l.keys.remove(key);
                }
            }
            inner.revision += 1;
        }
        Ok(removed.is_some())
    }

    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> MetaResult<ScanPage> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        let limit = limit.min(MAX_SCAN_LIMIT).max(1);

        let mut kvs = Vec::new();
        let mut more = false;
        for (key, entry) in inner.data.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(after) = start_after {
                if key.as_str() <= after {
                    continue;
                }
            }
            if kvs.len() == limit {
                more = true;
                break;
            }
            kvs.push(KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            });
        }
        Ok(ScanPage { kvs, more })
    }

    async fn txn(&self, guards: Vec<TxnGuard>, ops: Vec<TxnOp>) -> MetaResult<()> {
        if ops.len() > MAX_OPS_PER_TXN {
            return Err(MetaError::InvalidArgument(format!(
                "txn has {} ops, limit is {MAX_OPS_PER_TXN}",
                ops.len()
            )));
        }
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        Self::check_guards(&inner, &guards)?;
        for op in &ops {
            if let TxnOp::PutWithLease { lease, .. } = op {
                if !inner.leases.contains_key(lease) {
                    return Err(MetaError::InvalidArgument(format!(
                        "lease {} does not exist",
                        lease.0
                    )));
                }
            }
        }

        inner.revision += 1;
        let rev = inner.revision;
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    inner.data.insert(
                        key,
                        Entry {
                            value,
                            mod_revision: rev,
                            lease: None,
                        },
                    );
                }
                TxnOp::PutWithLease { key, value, lease } => {
                    inner.data.insert(
                        key.clone(),
                        Entry {
                            value,
                            mod_revision: rev,
                            lease: Some(lease),
                        },
                    );
                    if let Some(l) = inner.leases.get_mut(&lease) {
                        l.keys.insert(key);
                    }
                }
                TxnOp::Delete { key } => {
                    inner.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> MetaResult<LeaseId> {
        let mut inner = self.inner.lock();
        let id = LeaseId(inner.next_lease);
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> MetaResult<bool> {
        let mut inner = self.inner.lock();
        Self::expire_due_leases(&mut inner, Instant::now());
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        if let Some(l) = inner.leases.remove(&lease) {
            for key in l.keys {
                inner.data.remove(&key);
            }
        }
        Ok(())
    }
}
