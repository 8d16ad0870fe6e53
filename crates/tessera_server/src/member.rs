//! Leader election over the KV lease.
//!
//! Exactly one instance holds `/<root>/leader` at a time: the key is
//! written under a lease with a create-if-absent guard, so the KV itself
//! arbitrates. The holder renews at one third of the TTL; a missed renewal
//! lets the lease lapse, the key vanishes, and any member's next campaign
//! wins. Role changes are published on a watch channel so the server can
//! start the scheduler and resume procedures on election, and abort
//! in-flight writes on loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use tessera_common::{MetaError, MetaResult, ShutdownSignal};
use tessera_storage::{keys, KvBackend, LeaseId, TxnGuard, TxnOp};

/// Where the current leader lives, and whether that is us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub endpoint: String,
    pub is_local: bool,
}

pub struct Member {
    kv: Arc<dyn KvBackend>,
    root: String,
    advertise_addr: String,
    lease_ttl: Duration,
    is_leader: AtomicBool,
    lease: Mutex<Option<LeaseId>>,
    role_tx: watch::Sender<bool>,
}

impl Member {
    pub fn new(
        kv: Arc<dyn KvBackend>,
        root: impl Into<String>,
        advertise_addr: impl Into<String>,
        lease_ttl: Duration,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(false);
        Arc::new(Self {
            kv,
            root: root.into(),
            advertise_addr: advertise_addr.into(),
            lease_ttl,
            is_leader: AtomicBool::new(false),
            lease: Mutex::new(None),
            role_tx,
        })
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Subscribe to role changes: `true` = this instance is leader.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.role_tx.subscribe()
    }

    /// Who currently holds the leader key, if anyone.
    pub async fn get_leader(&self) -> MetaResult<Option<LeaderInfo>> {
        let key = keys::leader_key(&self.root);
        match self.kv.get(&key).await? {
            Some(kv) => {
                let endpoint = String::from_utf8(kv.value)
                    .map_err(|e| MetaError::Codec(format!("leader key: {e}")))?;
                let is_local = endpoint == self.advertise_addr;
                Ok(Some(LeaderInfo { endpoint, is_local }))
            }
            None => Ok(None),
        }
    }

    /// Try to take the leader key: one transaction guards the key absent
    /// and claims it under a fresh lease, so the KV arbitrates races.
    pub async fn try_campaign(&self) -> MetaResult<bool> {
        let key = keys::leader_key(&self.root);
        let lease = self.kv.grant_lease(self.lease_ttl).await?;
        match self
            .kv
            .txn(
                vec![TxnGuard {
                    key: key.clone(),
                    revision: 0,
                }],
                vec![TxnOp::PutWithLease {
                    key,
                    value: self.advertise_addr.clone().into_bytes(),
                    lease,
                }],
            )
            .await
        {
            Ok(()) => {
                *self.lease.lock() = Some(lease);
                self.set_role(true);
                info!(endpoint = %self.advertise_addr, "elected leader");
                Ok(true)
            }
            Err(MetaError::VersionConflict { .. }) => {
                self.kv.revoke_lease(lease).await?;
                Ok(false)
            }
            Err(other) => {
                self.kv.revoke_lease(lease).await?;
                Err(other)
            }
        }
    }

    /// Give up leadership voluntarily (shutdown path).
    pub async fn resign(&self) -> MetaResult<()> {
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            self.kv.revoke_lease(lease).await?;
        }
        if self.is_leader() {
            info!(endpoint = %self.advertise_addr, "resigned leadership");
        }
        self.set_role(false);
        Ok(())
    }

    fn set_role(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
        let _ = self.role_tx.send(leader);
    }

    /// Election loop: campaign while follower, renew at TTL/3 while
    /// leader. Failure to renew drops the role immediately; the stale
    /// lease lapses on its own.
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let renew_every = self.lease_ttl / 3;
            loop {
                let wait = if self.is_leader() {
                    renew_every
                } else {
                    // Follower: probe at lease granularity with a headstart
                    // so a lapsed leader is replaced within one TTL.
                    self.lease_ttl / 2
                };
                if shutdown.wait_timeout(wait).await {
                    if let Err(e) = self.resign().await {
                        warn!(error = %e, "resign on shutdown failed");
                    }
                    return;
                }

                if self.is_leader() {
                    let lease = *self.lease.lock();
                    let renewed = match lease {
                        Some(lease) => self.kv.keep_alive(lease).await.unwrap_or(false),
                        None => false,
                    };
                    if !renewed {
                        warn!(endpoint = %self.advertise_addr, "leader lease lost");
                        *self.lease.lock() = None;
                        self.set_role(false);
                    }
                } else {
                    match self.get_leader().await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            if let Err(e) = self.try_campaign().await {
                                warn!(error = %e, "campaign failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "leader lookup failed"),
                    }
                }
            }
        })
    }
}
