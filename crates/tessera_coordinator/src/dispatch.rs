//! Outbound event dispatch to data nodes.
//!
//! One method per RPC of the shard-node surface. Every request carries the
//! prior `ShardInfo` so the node can reject stale updates; every response
//! carries a `{code, error}` header and a non-zero code is surfaced as a
//! typed rejection. Transport errors are wrapped as retryable
//! `Unavailable` — dispatch itself never retries, the calling procedure
//! step owns retry policy.
//!
//! `HttpEventDispatch` is the production client: JSON bodies over HTTP,
//! one cached client per endpoint, re-dialed lazily and evicted after
//! repeated consecutive transport failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tessera_common::{MetaError, MetaResult, SchemaId, ShardId, ShardStatus, TableId};
use tessera_meta::ShardInfo;

/// Transport failures tolerated before an endpoint's cached client is
/// evicted and re-dialed from scratch on next use.
pub const MAX_CONSECUTIVE_DIAL_FAILURES: u32 = 3;

// ── Request/response types ──────────────────────────────────────────────────

/// The shard state the metadata service believes is current; data nodes
/// compare versions and reject stale updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateShardInfo {
    pub curr_shard_info: ShardInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenShardRequest {
    pub shard: ShardInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseShardRequest {
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
    pub encoded_schema: Vec<u8>,
    pub engine: String,
    pub create_if_not_exist: bool,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseTableOnShardRequest {
    pub update_shard_info: UpdateShardInfo,
    pub table_info: TableInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub code: u32,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventResponse {
    pub header: ResponseHeader,
    #[serde(default)]
    pub latest_shard_version: Option<u64>,
}

/// Older data nodes have no wire value for `Unknown`; it is collapsed to
/// `Ready` at this boundary only.
pub fn wire_status(status: ShardStatus) -> ShardStatus {
    match status {
        ShardStatus::Unknown => ShardStatus::Ready,
        other => other,
    }
}

// ── Trait ───────────────────────────────────────────────────────────────────

/// Outbound RPC surface of a data node. `endpoint` is the node name.
#[async_trait]
pub trait EventDispatch: Send + Sync {
    async fn open_shard(&self, endpoint: &str, request: OpenShardRequest) -> MetaResult<()>;

    async fn close_shard(&self, endpoint: &str, request: CloseShardRequest) -> MetaResult<()>;

    /// Returns the data node's shard version after the create.
    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        request: CreateTableOnShardRequest,
    ) -> MetaResult<u64>;

    /// Returns the data node's shard version after the drop.
    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        request: DropTableOnShardRequest,
    ) -> MetaResult<u64>;

    async fn open_table_on_shard(
        &self,
        endpoint: &str,
        request: OpenTableOnShardRequest,
    ) -> MetaResult<()>;

    async fn close_table_on_shard(
        &self,
        endpoint: &str,
        request: CloseTableOnShardRequest,
    ) -> MetaResult<()>;
}

// ── HTTP implementation ─────────────────────────────────────────────────────

struct Conn {
    client: reqwest::Client,
    consecutive_failures: u32,
}

/// HTTP/JSON dispatch client with a connection-per-endpoint cache.
pub struct HttpEventDispatch {
    conns: DashMap<String, Conn>,
    request_timeout: Duration,
}

impl HttpEventDispatch {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            conns: DashMap::new(),
            request_timeout,
        })
    }

    fn client_for(&self, endpoint: &str) -> MetaResult<reqwest::Client> {
        if let Some(conn) = self.conns.get(endpoint) {
            return Ok(conn.client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| MetaError::Internal(format!("build http client: {e}")))?;
        self.conns.insert(
            endpoint.to_string(),
            Conn {
                client: client.clone(),
                consecutive_failures: 0,
            },
        );
        Ok(client)
    }

    fn record_failure(&self, endpoint: &str) {
        let evict = match self.conns.get_mut(endpoint) {
            Some(mut conn) => {
                conn.consecutive_failures += 1;
                conn.consecutive_failures >= MAX_CONSECUTIVE_DIAL_FAILURES
            }
            None => false,
        };
        if evict {
            self.conns.remove(endpoint);
            warn!(endpoint, "evicted dispatch connection after repeated failures");
        }
    }

    fn record_success(&self, endpoint: &str) {
        if let Some(mut conn) = self.conns.get_mut(endpoint) {
            conn.consecutive_failures = 0;
        }
    }

    async fn call<Req: Serialize>(
        &self,
        endpoint: &str,
        op: &str,
        request: &Req,
    ) -> MetaResult<EventResponse> {
        let client = self.client_for(endpoint)?;
        let url = format!("http://{endpoint}/meta-event/{op}");
        let result = client.post(&url).json(request).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(endpoint);
                return Err(MetaError::unavailable(
                    format!("{op} to {endpoint}: {e}"),
                    100,
                ));
            }
        };
        let body: EventResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                self.record_failure(endpoint);
                return Err(MetaError::unavailable(
                    format!("{op} to {endpoint}: decode response: {e}"),
                    100,
                ));
            }
        };
        self.record_success(endpoint);
        if body.header.code != 0 {
            return Err(MetaError::DispatchRejected {
                endpoint: endpoint.to_string(),
                code: body.header.code,
                message: body.header.error.clone(),
            });
        }
        debug!(endpoint, op, "dispatched");
        metrics::counter!("tessera_dispatch_total", "op" => op.to_string()).increment(1);
        Ok(body)
    }
}

#[async_trait]
impl EventDispatch for HttpEventDispatch {
    async fn open_shard(&self, endpoint: &str, mut request: OpenShardRequest) -> MetaResult<()> {
        request.shard.status = wire_status(request.shard.status);
        self.call(endpoint, "openShard", &request).await.map(|_| ())
    }

    async fn close_shard(&self, endpoint: &str, request: CloseShardRequest) -> MetaResult<()> {
        self.call(endpoint, "closeShard", &request).await.map(|_| ())
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        mut request: CreateTableOnShardRequest,
    ) -> MetaResult<u64> {
        request.update_shard_info.curr_shard_info.status =
            wire_status(request.update_shard_info.curr_shard_info.status);
        let resp = self.call(endpoint, "createTableOnShard", &request).await?;
        Ok(resp.latest_shard_version.unwrap_or_default())
    }

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        request: DropTableOnShardRequest,
    ) -> MetaResult<u64> {
        let resp = self.call(endpoint, "dropTableOnShard", &request).await?;
        Ok(resp.latest_shard_version.unwrap_or_default())
    }

    async fn open_table_on_shard(
        &self,
        endpoint: &str,
        request: OpenTableOnShardRequest,
    ) -> MetaResult<()> {
        self.call(endpoint, "openTableOnShard", &request)
            .await
            .map(|_| ())
    }

    async fn close_table_on_shard(
        &self,
        endpoint: &str,
        request: CloseTableOnShardRequest,
    ) -> MetaResult<()> {
        self.call(endpoint, "closeTableOnShard", &request)
            .await
            .map(|_| ())
    }
}

// ── In-process test double ──────────────────────────────────────────────────

/// One observed dispatch call, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchCall {
    OpenShard { endpoint: String, shard_id: ShardId },
    CloseShard { endpoint: String, shard_id: ShardId },
    CreateTable { endpoint: String, shard_id: ShardId, table: String },
    DropTable { endpoint: String, shard_id: ShardId, table: String },
    OpenTable { endpoint: String, table: String },
    CloseTable { endpoint: String, table: String },
}

/// Records calls and simulates per-op failures; data-node shard versions
/// are tracked per shard and returned the way a real node would.
#[derive(Default)]
pub struct MockEventDispatch {
    calls: parking_lot::Mutex<Vec<DispatchCall>>,
    fail_remaining: DashMap<&'static str, u32>,
    reject_ops: DashMap<&'static str, String>,
    versions: DashMap<ShardId, u64>,
}

impl MockEventDispatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `times` calls of `op` fail with a transport error.
    pub fn fail_transport(&self, op: &'static str, times: u32) {
        self.fail_remaining.insert(op, times);
    }

    /// Every call of `op` is rejected by the remote with the message.
    pub fn reject(&self, op: &'static str, message: &str) {
        self.reject_ops.insert(op, message.to_string());
    }

    pub fn clear_reject(&self, op: &'static str) {
        self.reject_ops.remove(op);
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().clone()
    }

    pub fn calls_len(&self) -> usize {
        self.calls.lock().len()
    }

    fn gate(&self, op: &'static str, endpoint: &str) -> MetaResult<()> {
        if let Some(mut remaining) = self.fail_remaining.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MetaError::unavailable(format!("{op} to {endpoint}"), 10));
            }
        }
        if let Some(message) = self.reject_ops.get(op) {
            return Err(MetaError::DispatchRejected {
                endpoint: endpoint.to_string(),
                code: 500,
                message: message.value().clone(),
            });
        }
        Ok(())
    }

    fn bump_version(&self, shard_id: ShardId, floor: u64) -> u64 {
        let mut entry = self.versions.entry(shard_id).or_insert(0);
        *entry = (*entry).max(floor) + 1;
        *entry
    }
}

#[async_trait]
impl EventDispatch for MockEventDispatch {
    async fn open_shard(&self, endpoint: &str, request: OpenShardRequest) -> MetaResult<()> {
        self.gate("openShard", endpoint)?;
        self.calls.lock().push(DispatchCall::OpenShard {
            endpoint: endpoint.to_string(),
            shard_id: request.shard.shard_id,
        });
        Ok(())
    }

    async fn close_shard(&self, endpoint: &str, request: CloseShardRequest) -> MetaResult<()> {
        self.gate("closeShard", endpoint)?;
        self.calls.lock().push(DispatchCall::CloseShard {
            endpoint: endpoint.to_string(),
            shard_id: request.shard_id,
        });
        Ok(())
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        request: CreateTableOnShardRequest,
    ) -> MetaResult<u64> {
        self.gate("createTableOnShard", endpoint)?;
        let shard_id = request.update_shard_info.curr_shard_info.shard_id;
        self.calls.lock().push(DispatchCall::CreateTable {
            endpoint: endpoint.to_string(),
            shard_id,
            table: request.table_info.name.clone(),
        });
        Ok(self.bump_version(shard_id, request.update_shard_info.curr_shard_info.version))
    }

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        request: DropTableOnShardRequest,
    ) -> MetaResult<u64> {
        self.gate("dropTableOnShard", endpoint)?;
        let shard_id = request.update_shard_info.curr_shard_info.shard_id;
        self.calls.lock().push(DispatchCall::DropTable {
            endpoint: endpoint.to_string(),
            shard_id,
            table: request.table_info.name.clone(),
        });
        Ok(self.bump_version(shard_id, request.update_shard_info.curr_shard_info.version))
    }

    async fn open_table_on_shard(
        &self,
        endpoint: &str,
        request: OpenTableOnShardRequest,
    ) -> MetaResult<()> {
        self.gate("openTableOnShard", endpoint)?;
        self.calls.lock().push(DispatchCall::OpenTable {
            endpoint: endpoint.to_string(),
            table: request.table_info.name.clone(),
        });
        Ok(())
    }

    async fn close_table_on_shard(
        &self,
        endpoint: &str,
        request: CloseTableOnShardRequest,
    ) -> MetaResult<()> {
        self.gate("closeTableOnShard", endpoint)?;
        self.calls.lock().push(DispatchCall::CloseTable {
            endpoint: endpoint.to_string(),
            table: request.table_info.name.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::ShardRole;

    fn shard_info(shard: u32, version: u64) -> ShardInfo {
        ShardInfo {
            shard_id: ShardId(shard),
            role: ShardRole::Leader,
            version,
            status: ShardStatus::Ready,
        }
    }

    #[test]
    fn test_wire_status_collapses_unknown_only() {
        assert_eq!(wire_status(ShardStatus::Unknown), ShardStatus::Ready);
        assert_eq!(wire_status(ShardStatus::Ready), ShardStatus::Ready);
        assert_eq!(wire_status(ShardStatus::PartialOpen), ShardStatus::PartialOpen);
    }

    #[tokio::test]
    async fn test_mock_records_in_order() {
        let mock = MockEventDispatch::new();
        mock.close_shard(
            "n0",
            CloseShardRequest {
                shard_id: ShardId(1),
            },
        )
        .await
        .unwrap();
        mock.open_shard(
            "n1",
            OpenShardRequest {
                shard: shard_info(1, 3),
            },
        )
        .await
        .unwrap();

        let calls = mock.calls();
        assert_eq!(
            calls,
            vec![
                DispatchCall::CloseShard {
                    endpoint: "n0".into(),
                    shard_id: ShardId(1)
                },
                DispatchCall::OpenShard {
                    endpoint: "n1".into(),
                    shard_id: ShardId(1)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_transport_failures_are_bounded() {
        let mock = MockEventDispatch::new();
        mock.fail_transport("openShard", 2);
        let req = OpenShardRequest {
            shard: shard_info(0, 1),
        };
        assert!(mock.open_shard("n0", req.clone()).await.is_err());
        assert!(mock.open_shard("n0", req.clone()).await.is_err());
        assert!(mock.open_shard("n0", req).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_returns_monotonic_shard_versions() {
        let mock = MockEventDispatch::new();
        let req = CreateTableOnShardRequest {
            update_shard_info: UpdateShardInfo {
                curr_shard_info: shard_info(0, 5),
            },
            table_info: TableInfo {
                id: TableId(1),
                name: "cpu".into(),
                schema_id: SchemaId(1),
                schema_name: "public".into(),
            },
            encoded_schema: vec![],
            engine: "timeseries".into(),
            create_if_not_exist: true,
            options: HashMap::new(),
        };
        let v1 = mock.create_table_on_shard("n0", req.clone()).await.unwrap();
        let v2 = mock.create_table_on_shard("n0", req).await.unwrap();
        assert!(v2 > v1);
        assert!(v1 > 5);
    }

    #[tokio::test]
    async fn test_mock_rejection_is_typed() {
        let mock = MockEventDispatch::new();
        mock.reject("closeShard", "shard busy");
        let err = mock
            .close_shard(
                "n0",
                CloseShardRequest {
                    shard_id: ShardId(0),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::DispatchRejected { .. }));
        assert!(!err.is_retryable());
    }
}
