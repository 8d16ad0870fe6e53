use serde::{Deserialize, Serialize};

/// Top-level service configuration, loaded from TOML with CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub procedure: ProcedureConfig,
    #[serde(default)]
    pub limiter: FlowLimiterConfig,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            scheduler: SchedulerConfig::default(),
            procedure: ProcedureConfig::default(),
            limiter: FlowLimiterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admin HTTP listen address.
    pub http_listen_addr: String,
    /// Advertised endpoint of this instance (also the forwarding target
    /// other members use when this instance is leader).
    pub advertise_addr: String,
    /// Prometheus metrics listen address (empty = disabled).
    #[serde(default)]
    pub metrics_listen_addr: String,
    /// Leader lease TTL in seconds; the lease is renewed at one third of
    /// this interval.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: "0.0.0.0:8831".into(),
            advertise_addr: "127.0.0.1:8831".into(),
            metrics_listen_addr: String::new(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_lease_ttl_secs() -> u64 {
    9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root prefix of every key this service persists.
    pub root_path: String,
    /// Upper bound on keys returned by a single scan page.
    pub max_scan_limit: usize,
    /// Upper bound on operations in a single KV transaction.
    pub max_ops_per_txn: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: "/tessera".into(),
            max_scan_limit: 100,
            max_ops_per_txn: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// A node missing heartbeats for this long is considered offline.
    pub liveness_timeout_ms: u64,
    /// Per-operation timeout inside the heartbeat handler. A timeout fails
    /// the request, not the stream.
    pub op_timeout_ms: u64,
    /// Bound on queued outbound frames per node; oldest dropped on overflow.
    pub send_backlog: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            op_timeout_ms: 5_000,
            send_backlog: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between reconciliation ticks.
    pub tick_interval_ms: u64,
    /// Upper bound on procedures emitted per tick.
    pub max_procedures_per_tick: usize,
    /// Whether the scheduler starts enabled; hot-togglable via the admin API.
    pub enable_schedule: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            max_procedures_per_tick: 8,
            enable_schedule: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// Retry ceiling for a single step hitting transient errors.
    pub max_step_retries: u32,
    /// Initial backoff between step retries; doubles up to the cap.
    pub retry_backoff_ms: u64,
    /// Backoff ceiling.
    pub retry_backoff_cap_ms: u64,
    /// Bounded re-reads after a CAS conflict before failing StaleSnapshot.
    pub max_conflict_rereads: u32,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 5,
            retry_backoff_ms: 100,
            retry_backoff_cap_ms: 2_000,
            max_conflict_rereads: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowLimiterConfig {
    pub enable: bool,
    /// Tokens added per second.
    pub limit: u64,
    /// Bucket capacity.
    pub burst: u64,
}

impl Default for FlowLimiterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            limit: 100,
            burst: 1_000,
        }
    }
}
