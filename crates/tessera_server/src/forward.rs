//! Follower-to-leader request forwarding.
//!
//! Write-carrying requests that land on a follower are relayed to the
//! current leader and the leader's response is returned verbatim. The
//! HTTP client is cached per leader endpoint and rebuilt when leadership
//! moves.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use tessera_common::{MetaError, MetaResult};

use crate::member::{LeaderInfo, Member};

pub struct ForwardClient {
    member: Arc<Member>,
    clients: DashMap<String, reqwest::Client>,
    request_timeout: Duration,
}

impl ForwardClient {
    pub fn new(member: Arc<Member>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            member,
            clients: DashMap::new(),
            request_timeout,
        })
    }

    /// The current leader. `Unavailable` when no leader holds the key.
    pub async fn leader(&self) -> MetaResult<LeaderInfo> {
        self.member
            .get_leader()
            .await?
            .ok_or_else(|| MetaError::unavailable("no leader elected", 500))
    }

    /// None when this instance is the leader and should handle the
    /// request locally; the leader endpoint otherwise.
    pub async fn forward_target(&self) -> MetaResult<Option<String>> {
        let leader = self.leader().await?;
        if leader.is_local {
            return Ok(None);
        }
        Ok(Some(leader.endpoint))
    }

    fn client_for(&self, endpoint: &str) -> MetaResult<reqwest::Client> {
        if let Some(client) = self.clients.get(endpoint) {
            return Ok(client.value().clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| MetaError::Internal(format!("build forward client: {e}")))?;
        self.clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    /// Relay a JSON request to the leader; returns (status, body) exactly
    /// as the leader produced them.
    pub async fn relay(
        &self,
        endpoint: &str,
        method: &str,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> MetaResult<(u16, serde_json::Value)> {
        let client = self.client_for(endpoint)?;
        let url = format!("http://{endpoint}{path_and_query}");
        debug!(method, url, "forwarding to leader");
        let request = match method {
            "GET" => client.get(&url),
            "POST" => client.post(&url),
            "PUT" => client.put(&url),
            "DELETE" => client.delete(&url),
            other => {
                return Err(MetaError::InvalidArgument(format!(
                    "unsupported forward method {other}"
                )))
            }
        };
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| MetaError::unavailable(format!("forward to {endpoint}: {e}"), 200))?;
        let status = response.status().as_u16();
        let body = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }
}
