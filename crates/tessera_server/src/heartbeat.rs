//! Heartbeat handling: one long-lived stream per data node.
//!
//! The wire framing lives outside this module; what arrives here is a
//! sequence of [`HeartbeatFrame`]s per node. The first frame binds the
//! node to an outbound frame queue, later frames refresh liveness and
//! replace the node's advertised shard state, and unbind happens on
//! stream close or when a newer stream claims the same node.
//!
//! The handler never blocks on a slow node: outbound frames go through a
//! bounded backlog that drops the oldest entry on overflow (logged), and
//! every frame is processed under `op_timeout` — a timeout fails that
//! request, not the stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use tessera_common::{MetaError, MetaResult};
use tessera_meta::{ClusterManager, ShardInfo};
use tessera_storage::NodeStats;

/// One inbound heartbeat from a data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub cluster_name: String,
    /// Node name, doubling as its RPC endpoint.
    pub node: String,
    #[serde(default)]
    pub stats: NodeStats,
    /// The node's current view of the shards it serves.
    #[serde(default)]
    pub shard_infos: Vec<ShardInfo>,
}

/// Outbound frame to a data node (acks and piggybacked notices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

impl OutboundFrame {
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn error(err: &MetaError) -> Self {
        Self {
            code: err.code() as u32,
            message: err.to_string(),
        }
    }
}

// ── Bounded backlog ─────────────────────────────────────────────────────────

/// Non-blocking bounded queue joining the frame processor to the stream
/// writer task. Push never blocks; overflow drops the oldest frame.
pub struct FrameQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
    capacity: usize,
    notify: Notify,
    closed: Mutex<bool>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: Mutex::new(false),
        })
    }

    /// Returns the number of frames dropped to make room (0 or 1).
    pub fn push(&self, frame: OutboundFrame) -> usize {
        let mut frames = self.frames.lock();
        let mut dropped = 0;
        if frames.len() >= self.capacity {
            frames.pop_front();
            dropped = 1;
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_waiters();
        dropped
    }

    /// Wait for the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
                if *self.closed.lock() {
                    return None;
                }
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register the waiter before re-checking so a push racing with
            // the check cannot be missed.
            notified.as_mut().enable();
            {
                let frames = self.frames.lock();
                if !frames.is_empty() || *self.closed.lock() {
                    continue;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

// ── Handler ─────────────────────────────────────────────────────────────────

struct Binding {
    seq: u64,
    queue: Arc<FrameQueue>,
}

pub struct HeartbeatHandler {
    clusters: Arc<ClusterManager>,
    op_timeout: Duration,
    backlog: usize,
    bindings: DashMap<String, Binding>,
    next_seq: AtomicU64,
}

impl HeartbeatHandler {
    pub fn new(clusters: Arc<ClusterManager>, op_timeout: Duration, backlog: usize) -> Arc<Self> {
        Arc::new(Self {
            clusters,
            op_timeout,
            backlog,
            bindings: DashMap::new(),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Bind a node to a fresh outbound queue; an existing binding for the
    /// same node is replaced and its queue closed. Returns the queue and
    /// the binding token needed to unbind.
    pub fn bind(&self, node: &str) -> (Arc<FrameQueue>, u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let queue = FrameQueue::new(self.backlog);
        if let Some(old) = self.bindings.insert(
            node.to_string(),
            Binding {
                seq,
                queue: queue.clone(),
            },
        ) {
            debug!(node, old_seq = old.seq, "heartbeat stream superseded");
            old.queue.close();
        }
        (queue, seq)
    }

    /// Unbind on stream close. A stale token (superseded stream) is a
    /// no-op so the newer stream stays bound.
    pub fn unbind(&self, node: &str, seq: u64) {
        let matches = self
            .bindings
            .get(node)
            .map(|b| b.seq == seq)
            .unwrap_or(false);
        if matches {
            if let Some((_, binding)) = self.bindings.remove(node) {
                binding.queue.close();
            }
        }
    }

    pub fn is_bound(&self, node: &str) -> bool {
        self.bindings.contains_key(node)
    }

    /// Process one frame: refresh the node row and replace its advertised
    /// shard state. The op timeout fails the frame, never the stream.
    pub async fn handle_frame(&self, frame: HeartbeatFrame) -> MetaResult<()> {
        let work = async {
            let cluster = self.clusters.get_cluster(&frame.cluster_name)?;
            cluster
                .register_node(&frame.node, frame.stats.clone(), frame.shard_infos.clone())
                .await
        };
        match tokio::time::timeout(self.op_timeout, work).await {
            Ok(result) => {
                metrics::counter!("tessera_heartbeat_frames_total").increment(1);
                result
            }
            Err(_) => Err(MetaError::Timeout(format!(
                "heartbeat frame from {} exceeded {}ms",
                frame.node,
                self.op_timeout.as_millis()
            ))),
        }
    }

    /// Queue an outbound frame to a bound node without blocking.
    pub fn send_to_node(&self, node: &str, frame: OutboundFrame) -> MetaResult<()> {
        let binding = self
            .bindings
            .get(node)
            .ok_or_else(|| MetaError::NodeNotFound(format!("{node} has no heartbeat stream")))?;
        let dropped = binding.queue.push(frame);
        if dropped > 0 {
            warn!(node, "heartbeat backlog overflow, dropped oldest frame");
            metrics::counter!("tessera_heartbeat_dropped_frames_total").increment(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_meta::CreateClusterOpts;
    use tessera_storage::{MemKv, MetaStorage};

    async fn handler_with_cluster() -> Arc<HeartbeatHandler> {
        let storage = MetaStorage::new(Arc::new(MemKv::new()), "/tessera");
        let clusters = Arc::new(ClusterManager::new(storage));
        clusters
            .create_cluster("defaultCluster", CreateClusterOpts::default())
            .await
            .unwrap();
        HeartbeatHandler::new(clusters, Duration::from_millis(500), 4)
    }

    fn frame(node: &str) -> HeartbeatFrame {
        HeartbeatFrame {
            cluster_name: "defaultCluster".into(),
            node: node.into(),
            stats: NodeStats::default(),
            shard_infos: vec![],
        }
    }

    #[tokio::test]
    async fn test_frame_registers_node() {
        let handler = handler_with_cluster().await;
        handler.handle_frame(frame("node-0")).await.unwrap();
        let cluster = handler.clusters.get_cluster("defaultCluster").unwrap();
        assert_eq!(cluster.list_registered_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_cluster_fails_frame_only() {
        let handler = handler_with_cluster().await;
        let mut bad = frame("node-0");
        bad.cluster_name = "nope".into();
        assert!(handler.handle_frame(bad).await.is_err());
        // The stream would stay up; a later good frame works.
        handler.handle_frame(frame("node-0")).await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_bind_supersedes() {
        let handler = handler_with_cluster().await;
        let (old_queue, old_seq) = handler.bind("node-0");
        let (_new_queue, _new_seq) = handler.bind("node-0");

        // The superseded queue is closed.
        assert!(old_queue.pop().await.is_none());

        // Unbinding with the stale token must not evict the new stream.
        handler.unbind("node-0", old_seq);
        assert!(handler.is_bound("node-0"));
    }

    #[tokio::test]
    async fn test_unbind_with_current_token() {
        let handler = handler_with_cluster().await;
        let (_queue, seq) = handler.bind("node-0");
        handler.unbind("node-0", seq);
        assert!(!handler.is_bound("node-0"));
        assert!(handler.send_to_node("node-0", OutboundFrame::ok()).is_err());
    }

    #[tokio::test]
    async fn test_backlog_drops_oldest() {
        let handler = handler_with_cluster().await;
        let (queue, _seq) = handler.bind("node-0");
        for code in 0..6u32 {
            handler
                .send_to_node(
                    "node-0",
                    OutboundFrame {
                        code,
                        message: String::new(),
                    },
                )
                .unwrap();
        }
        // Capacity is 4: codes 0 and 1 were dropped.
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop().await.unwrap().code, 2);
    }

    #[tokio::test]
    async fn test_queue_pop_waits_for_push() {
        let queue = FrameQueue::new(4);
        let reader = queue.clone();
        let handle = tokio::spawn(async move { reader.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(OutboundFrame::ok());
        let frame = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Some(OutboundFrame::ok()));
    }
}
