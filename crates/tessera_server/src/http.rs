//! Admin HTTP API under `/api/v1`.
//!
//! Every response uses the `{status, data, error, msg}` envelope. Write
//! (and cluster-state) endpoints arriving at a follower are transparently
//! relayed to the leader and the leader's response returned verbatim;
//! `/health` and `/leader` are always answered locally.

use std::sync::Arc;

use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use tessera_common::{ErrorCode, MetaError, MetaResult, ProcedureId, ShardId, TopologyType};
use tessera_coordinator::ShardAffinityRule;
use tessera_meta::CreateClusterOpts;

use crate::forward::ForwardClient;
use crate::heartbeat::{HeartbeatFrame, HeartbeatHandler};
use crate::service::MetaService;
use crate::status::ServerStatus;

pub struct AppState {
    pub service: Arc<MetaService>,
    pub forward: Arc<ForwardClient>,
    pub heartbeat: Arc<HeartbeatHandler>,
    pub status: Arc<ServerStatus>,
}

pub fn api_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/getShardTables", post(get_shard_tables))
        .route("/transferLeader", post(transfer_leader))
        .route("/split", post(split))
        .route("/route", post(route_tables))
        .route("/table", delete(drop_table))
        .route("/getNodeShards", post(get_node_shards))
        .route("/flowLimiter", get(get_flow_limiter).put(update_flow_limiter))
        .route("/health", get(health))
        .route("/leader", get(leader))
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route("/clusters/{cluster}", put(update_cluster))
        .route("/clusters/{cluster}/procedure", get(list_procedures).delete(cancel_procedure))
        .route(
            "/clusters/{cluster}/shardAffinities",
            get(list_affinities).post(add_affinities).delete(remove_affinity),
        )
        .route(
            "/clusters/{cluster}/enableSchedule",
            get(get_enable_schedule).put(set_enable_schedule),
        )
        .route("/diagnose/{cluster}/shards", get(diagnose_shards))
        .route("/nodeHeartbeat", post(node_heartbeat))
        .route("/etcd/member", get(etcd_member).put(etcd_unsupported).post(etcd_unsupported).delete(etcd_unsupported))
        .route("/etcd/promoteLearner", post(etcd_unsupported))
        .route("/etcd/moveLeader", post(etcd_unsupported));

    Router::new()
        .nest("/api/v1", v1)
        .with_state(state)
}

// ── Envelope ────────────────────────────────────────────────────────────────

fn ok_response(data: impl serde::Serialize) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "data": data })),
    )
        .into_response()
}

fn err_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Ok => StatusCode::OK,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn err_response(err: &MetaError) -> Response {
    (
        err_status(err.code()),
        Json(json!({
            "status": "error",
            "error": err.code().as_str(),
            "msg": err.to_string(),
        })),
    )
        .into_response()
}

fn respond<T: serde::Serialize>(result: MetaResult<T>) -> Response {
    match result {
        Ok(data) => ok_response(data),
        Err(err) => err_response(&err),
    }
}

/// Relay to the leader when this instance is a follower. `Ok(None)` means
/// handle locally.
async fn maybe_forward(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    body: Option<&Value>,
) -> MetaResult<Option<Response>> {
    let Some(endpoint) = state.forward.forward_target().await? else {
        return Ok(None);
    };
    debug!(%method, %uri, endpoint, "relaying to leader");
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let (status, value) = state
        .forward
        .relay(&endpoint, method.as_str(), path_and_query, body.cloned())
        .await?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok(Some((status, Json(value)).into_response()))
}

macro_rules! forward_or_local {
    ($state:expr, $method:expr, $uri:expr, $body:expr) => {
        match maybe_forward($state, $method, $uri, $body).await {
            Ok(Some(response)) => return response,
            Ok(None) => {}
            Err(err) => return err_response(&err),
        }
    };
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> MetaResult<T> {
    serde_json::from_value(body)
        .map_err(|e| MetaError::InvalidArgument(format!("parse request: {e}")))
}

// ── Request bodies ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GetShardTablesRequest {
    cluster_name: String,
    #[serde(default)]
    shard_ids: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct TransferLeaderRequest {
    cluster_name: String,
    shard_id: u32,
    target_node: String,
}

#[derive(Debug, Deserialize)]
struct SplitRequest {
    cluster_name: String,
    schema_name: String,
    shard_id: u32,
    split_tables: Vec<String>,
    node_name: String,
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    cluster_name: String,
    schema_name: String,
    table_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DropTableRequest {
    cluster_name: String,
    schema_name: String,
    table: String,
}

#[derive(Debug, Deserialize)]
struct GetNodeShardsRequest {
    cluster_name: String,
    #[serde(default)]
    node_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateClusterRequest {
    name: String,
    node_count: u32,
    shard_total: u32,
    #[serde(default)]
    topology_type: Option<String>,
    #[serde(default)]
    procedure_executing_batch_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UpdateClusterRequest {
    #[serde(default)]
    topology_type: Option<String>,
    #[serde(default)]
    procedure_executing_batch_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RemoveAffinityRequest {
    shard_id: u32,
}

#[derive(Debug, Deserialize)]
struct EnableScheduleRequest {
    enable: bool,
}

#[derive(Debug, Deserialize)]
struct CancelProcedureQuery {
    id: u64,
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Response {
    ok_response(json!({ "status": state.status.get().as_str() }))
}

async fn leader(State(state): State<Arc<AppState>>) -> Response {
    match state.forward.leader().await {
        Ok(info) => ok_response(json!({
            "endpoint": info.endpoint,
            "is_local": info.is_local,
        })),
        Err(err) => err_response(&err),
    }
}

async fn get_shard_tables(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: GetShardTablesRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    let shard_ids: Vec<ShardId> = request.shard_ids.into_iter().map(ShardId).collect();
    respond(
        state
            .service
            .get_tables_of_shards(&request.cluster_name, &shard_ids),
    )
}

async fn transfer_leader(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: TransferLeaderRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .transfer_leader(
                &request.cluster_name,
                ShardId(request.shard_id),
                &request.target_node,
            )
            .await
            .map(|_| json!({ "shard_id": request.shard_id })),
    )
}

async fn split(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: SplitRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .split(
                &request.cluster_name,
                &request.schema_name,
                ShardId(request.shard_id),
                &request.split_tables,
                &request.node_name,
            )
            .await
            .map(|new_shard| json!({ "new_shard_id": new_shard.0 })),
    )
}

async fn route_tables(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: RouteRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .route_tables(
                &request.cluster_name,
                &request.schema_name,
                &request.table_names,
            )
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|e| {
                        json!({
                            "table": e.table.name,
                            "table_id": e.table.id.0,
                            "shard_id": e.shard_id.0,
                            "node": e.node_name,
                            "shard_version": e.shard_version,
                        })
                    })
                    .collect::<Vec<_>>()
            }),
    )
}

async fn drop_table(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: DropTableRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .drop_table(&request.cluster_name, &request.schema_name, &request.table)
            .await
            .map(|_| json!({ "table": request.table })),
    )
}

async fn get_node_shards(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: GetNodeShardsRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    let result = match request.node_name {
        Some(node) => state
            .service
            .node_shards(&request.cluster_name, &node)
            .map(|shards| {
                let mut by_node = serde_json::Map::new();
                by_node.insert(node.clone(), json!(shards));
                Value::Object(by_node)
            }),
        None => state.service.get_nodes(&request.cluster_name).map(|nodes| {
            let by_node: serde_json::Map<String, Value> = nodes
                .into_iter()
                .map(|n| {
                    let shards: Vec<u32> =
                        n.shard_infos.iter().map(|i| i.shard_id.0).collect();
                    (n.node.name, json!(shards))
                })
                .collect();
            Value::Object(by_node)
        }),
    };
    respond(result)
}

async fn get_flow_limiter(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    let config = state.service.limiter().config();
    ok_response(json!({
        "enable": config.enable,
        "limit": config.limit,
        "burst": config.burst,
        "available": state.service.limiter().available(),
    }))
}

async fn update_flow_limiter(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let config: tessera_common::config::FlowLimiterConfig = match parse(body) {
        Ok(c) => c,
        Err(e) => return err_response(&e),
    };
    state.service.limiter().update(config.clone());
    ok_response(json!({ "enable": config.enable, "limit": config.limit, "burst": config.burst }))
}

async fn list_clusters(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    ok_response(state.service.list_clusters())
}

async fn create_cluster(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: CreateClusterRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    let topology_type = match request.topology_type.as_deref() {
        None => TopologyType::Static,
        Some(raw) => match raw.parse() {
            Ok(t) => t,
            Err(e) => return err_response(&MetaError::InvalidArgument(e)),
        },
    };
    let opts = CreateClusterOpts {
        min_node_count: request.node_count,
        shard_total: request.shard_total,
        topology_type,
        procedure_executing_batch_size: request.procedure_executing_batch_size.unwrap_or(4),
    };
    respond(
        state
            .service
            .create_cluster(&request.name, opts)
            .await
            .map(|snapshot| json!({ "name": request.name, "id": snapshot.cluster.id.0 })),
    )
}

async fn update_cluster(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: UpdateClusterRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    let topology_type = match request.topology_type.as_deref() {
        None => None,
        Some(raw) => match raw.parse() {
            Ok(t) => Some(t),
            Err(e) => return err_response(&MetaError::InvalidArgument(e)),
        },
    };
    respond(
        state
            .service
            .update_cluster(
                &cluster,
                topology_type,
                request.procedure_executing_batch_size,
            )
            .await
            .map(|snapshot| json!({ "name": cluster, "version": snapshot.topology.cluster_view.version })),
    )
}

async fn list_procedures(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    respond(state.service.list_procedures(&cluster).map(|procedures| {
        procedures
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id.0,
                    "kind": p.kind.as_str(),
                    "state": format!("{:?}", p.state).to_lowercase(),
                })
            })
            .collect::<Vec<_>>()
    }))
}

async fn cancel_procedure(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
    Query(query): Query<CancelProcedureQuery>,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    respond(
        state
            .service
            .cancel_procedure(&cluster, ProcedureId(query.id))
            .map(|cancelled| json!({ "cancelled": cancelled })),
    )
}

async fn list_affinities(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    respond(state.service.list_shard_affinities(&cluster))
}

async fn add_affinities(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let rules: Vec<ShardAffinityRule> = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .add_shard_affinities(&cluster, rules)
            .map(|_| json!({ "status": "ok" })),
    )
}

async fn remove_affinity(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: RemoveAffinityRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .remove_shard_affinity(&cluster, ShardId(request.shard_id))
            .map(|removed| json!({ "removed": removed })),
    )
}

async fn get_enable_schedule(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    respond(
        state
            .service
            .get_enable_schedule(&cluster)
            .map(|enable| json!({ "enable": enable })),
    )
}

async fn set_enable_schedule(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let request: EnableScheduleRequest = match parse(body) {
        Ok(r) => r,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .service
            .set_enable_schedule(&cluster, request.enable)
            .map(|_| json!({ "enable": request.enable })),
    )
}

async fn diagnose_shards(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(cluster): Path<String>,
) -> Response {
    forward_or_local!(&state, &method, &uri, None);
    respond(state.service.diagnose_shards(&cluster))
}

async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<Value>,
) -> Response {
    forward_or_local!(&state, &method, &uri, Some(&body));
    let frame: HeartbeatFrame = match parse(body) {
        Ok(f) => f,
        Err(e) => return err_response(&e),
    };
    respond(
        state
            .heartbeat
            .handle_frame(frame)
            .await
            .map(|_| json!({ "code": 0 })),
    )
}

async fn etcd_member(State(state): State<Arc<AppState>>) -> Response {
    // The embedded KV has exactly one member: this process.
    ok_response(json!({
        "members": [ state.service.member().advertise_addr() ],
    }))
}

async fn etcd_unsupported() -> Response {
    err_response(&MetaError::InvalidArgument(
        "membership operations require an etcd-backed store".into(),
    ))
}
