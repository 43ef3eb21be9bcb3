use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    command::{Command, CommandOutcome, CommandResponse},
    domain::{DomainError, Service, ServiceSpec},
    raft::{
        app::{NotLeaderError, RaftFacade},
        http_rpc::{RaftRpcState, build_raft_rpc_router},
        types::{NodeId, NodeMeta, TypeConfig},
    },
    registry::{Registry, ServiceQuery},
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Mutex<Registry>>,
    pub raft: Arc<dyn RaftFacade>,
}

#[derive(Debug)]
pub struct ApiError {
    code: String,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn not_leader(message: impl Into<String>) -> Self {
        Self::new("not_leader", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match value.code() {
            "not_found" => ApiError::not_found(value.to_string()),
            "conflict" => ApiError::conflict(value.to_string()),
            _ => ApiError::invalid_request(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(
    registry: Arc<Mutex<Registry>>,
    raft: Arc<dyn RaftFacade>,
    raft_rpc: Option<openraft::Raft<TypeConfig>>,
) -> Router {
    let state = AppState { registry, raft };

    let mut router = Router::new()
        .route("/api/services", get(list_services).post(register_generated))
        .route(
            "/api/services/:uuid",
            put(register_service)
                .patch(update_ttl)
                .delete(remove_service)
                .get(get_service),
        )
        .route(
            "/api/services/:uuid/callbacks/:callback_uuid",
            put(add_callback),
        )
        .route("/api/cluster/join", post(cluster_join))
        .route("/api/cluster/status", get(cluster_status))
        .with_state(state);

    if let Some(raft) = raft_rpc {
        router = router.merge(build_raft_rpc_router(RaftRpcState { raft }));
    }

    router
}

/// Submits a command through consensus and unwraps the replicated response.
async fn submit(state: &AppState, cmd: Command) -> Result<CommandOutcome, ApiError> {
    match state.raft.client_write(cmd).await {
        Ok(CommandResponse::Ok { result }) => Ok(result),
        Ok(CommandResponse::Err {
            status,
            code,
            message,
        }) => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Err(ApiError::new(&code, status, message))
        }
        Err(err) => match err.downcast_ref::<NotLeaderError>() {
            Some(not_leader) => Err(ApiError::not_leader(not_leader.to_string())),
            None => Err(ApiError::internal(err.to_string())),
        },
    }
}

fn expect_service(outcome: CommandOutcome) -> Result<Service, ApiError> {
    match outcome {
        CommandOutcome::Service { service } => Ok(service),
        _ => Err(ApiError::internal("unexpected command outcome shape")),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UuidResponse {
    uuid: String,
}

async fn register_service(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(spec): Json<ServiceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let cmd = Command::add_service(uuid, spec)?;
    let service = expect_service(submit(&state, cmd).await?)?;
    Ok((StatusCode::CREATED, Json(service)))
}

/// Registration without a caller-chosen uuid; the directory assigns one.
async fn register_generated(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = uuid::Uuid::new_v4().to_string();
    let cmd = Command::add_service(uuid, spec)?;
    let service = expect_service(submit(&state, cmd).await?)?;
    Ok((StatusCode::CREATED, Json(service)))
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateTtlRequest {
    ttl: u32,
}

async fn update_ttl(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(req): Json<UpdateTtlRequest>,
) -> Result<Json<UuidResponse>, ApiError> {
    let cmd = Command::update_ttl(uuid, req.ttl)?;
    match submit(&state, cmd).await? {
        CommandOutcome::Uuid { uuid } => Ok(Json(UuidResponse { uuid })),
        _ => Err(ApiError::internal("unexpected command outcome shape")),
    }
}

async fn remove_service(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<UuidResponse>, ApiError> {
    let cmd = Command::remove_service(uuid)?;
    match submit(&state, cmd).await? {
        CommandOutcome::Uuid { uuid } => Ok(Json(UuidResponse { uuid })),
        _ => Err(ApiError::internal("unexpected command outcome shape")),
    }
}

async fn add_callback(
    State(state): State<AppState>,
    Path((uuid, callback_uuid)): Path<(String, String)>,
) -> Result<Json<Service>, ApiError> {
    let target = {
        let registry = state.registry.lock().await;
        registry
            .get_uuid(&uuid)
            .ok_or_else(|| ApiError::not_found(format!("service not found: {uuid}")))?
    };
    let cmd = Command::add_callback(target, callback_uuid)?;
    let service = expect_service(submit(&state, cmd).await?)?;
    Ok(Json(service))
}

#[derive(Debug, Serialize)]
struct ServiceView {
    #[serde(flatten)]
    service: Service,
    remaining_ttl: u32,
}

async fn get_service(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<ServiceView>, ApiError> {
    let registry = state.registry.lock().await;
    let service = registry
        .get_uuid(&uuid)
        .ok_or_else(|| ApiError::not_found(format!("service not found: {uuid}")))?;
    let remaining_ttl = service.remaining_ttl(Utc::now());
    Ok(Json(ServiceView {
        service,
        remaining_ttl,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    name: Option<String>,
    environment: Option<String>,
    region: Option<String>,
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<Service>> {
    let registry = state.registry.lock().await;
    let services = registry.query(
        &ServiceQuery {
            name: query.name,
            environment: query.environment,
            region: query.region,
        },
        Utc::now(),
    );
    Json(services)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub name: String,
    pub api_base_url: String,
    pub raft_endpoint: String,
}

/// Leader-side join: admit the node as a learner, then promote it to voter
/// once its log has caught up (openraft blocks the membership change on
/// catch-up).
async fn cluster_join(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let meta = NodeMeta {
        name: req.name,
        api_base_url: req.api_base_url,
        raft_endpoint: req.raft_endpoint,
    };
    state
        .raft
        .add_learner(req.node_id, meta)
        .await
        .map_err(|e| ApiError::internal(format!("add learner: {e}")))?;
    state
        .raft
        .add_voters(std::collections::BTreeSet::from([req.node_id]))
        .await
        .map_err(|e| ApiError::internal(format!("promote voter: {e}")))?;
    Ok(Json(serde_json::json!({ "node_id": req.node_id })))
}

#[derive(Debug, Serialize)]
struct ClusterStatus {
    state: String,
    current_leader: Option<NodeId>,
    voters: Vec<NodeId>,
    nodes: BTreeMap<NodeId, NodeMeta>,
    registered_services: usize,
}

async fn cluster_status(State(state): State<AppState>) -> Json<ClusterStatus> {
    let metrics = state.raft.metrics().borrow().clone();
    let nodes = metrics
        .membership_config
        .nodes()
        .map(|(id, node)| (*id, node.clone()))
        .collect();
    let registered_services = state.registry.lock().await.len();
    Json(ClusterStatus {
        state: format!("{:?}", metrics.state),
        current_leader: metrics.current_leader,
        voters: metrics.membership_config.voter_ids().collect(),
        nodes,
        registered_services,
    })
}
