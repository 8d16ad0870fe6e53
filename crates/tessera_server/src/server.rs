//! Server assembly: every long-lived component is built once here and
//! owned by the [`Server`] value.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use tessera_common::config::MetaConfig;
use tessera_common::ShutdownSignal;
use tessera_coordinator::{FlowLimiter, HttpEventDispatch};
use tessera_meta::ClusterManager;
use tessera_storage::{KvBackend, MemKv, MetaStorage};

use crate::forward::ForwardClient;
use crate::heartbeat::HeartbeatHandler;
use crate::http::{api_router, AppState};
use crate::member::Member;
use crate::service::MetaService;
use crate::status::{ServerStatus, Status};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    config: MetaConfig,
    pub service: Arc<MetaService>,
    pub member: Arc<Member>,
    pub heartbeat: Arc<HeartbeatHandler>,
    pub forward: Arc<ForwardClient>,
    pub status: Arc<ServerStatus>,
    shutdown: ShutdownSignal,
}

impl Server {
    /// Wire the whole process. The embedded `MemKv` backs a single-member
    /// deployment; a clustered deployment swaps in another `KvBackend`.
    pub async fn build(config: MetaConfig) -> anyhow::Result<Server> {
        let kv: Arc<dyn KvBackend> = Arc::new(MemKv::new());
        Self::build_with_kv(config, kv).await
    }

    pub async fn build_with_kv(
        config: MetaConfig,
        kv: Arc<dyn KvBackend>,
    ) -> anyhow::Result<Server> {
        let storage = MetaStorage::new(kv.clone(), config.storage.root_path.clone());
        let clusters = Arc::new(ClusterManager::new(storage));
        clusters.load().await.context("load clusters from kv")?;

        let member = Member::new(
            kv,
            config.storage.root_path.clone(),
            config.server.advertise_addr.clone(),
            Duration::from_secs(config.server.lease_ttl_secs),
        );
        let forward = ForwardClient::new(member.clone(), RPC_TIMEOUT);
        let dispatch = HttpEventDispatch::new(RPC_TIMEOUT);
        let limiter = FlowLimiter::new(config.limiter.clone());
        let heartbeat = HeartbeatHandler::new(
            clusters.clone(),
            Duration::from_millis(config.heartbeat.op_timeout_ms),
            config.heartbeat.send_backlog,
        );
        let service = MetaService::new(
            config.clone(),
            clusters,
            dispatch,
            limiter,
            member.clone(),
        );

        Ok(Server {
            config,
            service,
            member,
            heartbeat,
            forward,
            status: Arc::new(ServerStatus::new()),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal fires. Returns an error (and a
    /// non-zero exit) when the HTTP port cannot be bound.
    pub async fn run(&self) -> anyhow::Result<()> {
        // React to elections: the winner reloads state, resumes
        // procedures, and starts scheduling; a deposed leader stops.
        let service = self.service.clone();
        let mut role = self.member.subscribe();
        let role_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if role.changed().await.is_err() || role_shutdown.is_shutdown() {
                    return;
                }
                let is_leader = *role.borrow();
                if is_leader {
                    if let Err(e) = service.on_elected().await {
                        warn!(error = %e, "post-election setup failed");
                    }
                } else {
                    service.on_leadership_lost();
                }
            }
        });
        self.member.clone().start(self.shutdown.clone());

        let state = Arc::new(AppState {
            service: self.service.clone(),
            forward: self.forward.clone(),
            heartbeat: self.heartbeat.clone(),
            status: self.status.clone(),
        });
        let router = api_router(state);

        let listener = tokio::net::TcpListener::bind(&self.config.server.http_listen_addr)
            .await
            .with_context(|| {
                format!("bind http listener on {}", self.config.server.http_listen_addr)
            })?;
        self.status.set(Status::Serving);
        info!(addr = %self.config.server.http_listen_addr, "serving");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .context("http server")?;

        self.status.set(Status::Stopped);
        self.member.resign().await.ok();
        info!("stopped");
        Ok(())
    }
}
