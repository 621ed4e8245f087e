//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::{
    ActorRequest, CreateChangeSetRequest, CreateInstanceRequest, HealthResponse, LogsQuery,
    ProgressUpdateRequest, PromoteRequest, ProvisioningProgress, RollbackRequest,
    SecretValueResponse, SecretWriteRequest, VersionResponse,
};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::errors::{FleetError, ProviderErrorKind};
use crate::models::{ChangeSet, DeploymentType, Instance, Manifest};
use crate::providers::{LogEvent, LogOptions};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// A `FleetError` rendered as a structured JSON body
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

/// HTTP status for a fleet error
pub fn status_code(err: &FleetError) -> StatusCode {
    match err {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::Conflict(_) | FleetError::InvalidState(_) => StatusCode::CONFLICT,
        FleetError::ValidationError(_) | FleetError::ManifestError(_) | FleetError::JsonError(_) => {
            StatusCode::BAD_REQUEST
        }
        FleetError::Provider(e) => match e.kind {
            ProviderErrorKind::NotFound => StatusCode::NOT_FOUND,
            ProviderErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ProviderErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        },
        FleetError::HttpError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(self.0.to_response())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================== SERVICE ================================== //

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ============================== INSTANCES ================================ //

/// Create an instance in PENDING from a manifest
pub async fn create_instance_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let manifest = Manifest::from_value(request.manifest)?;
    let deployment_type = request
        .deployment_type
        .as_deref()
        .map(str::parse::<DeploymentType>)
        .transpose()?;
    let workspace = request.workspace_id.unwrap_or_else(|| state.workspace.clone());

    let mut instance = Instance::new(request.name, workspace, &manifest, deployment_type);
    instance.fleet_id = request.fleet_id;
    instance.deployment_target_id = request.deployment_target_id;
    instance.metadata = request.metadata;

    let created = state
        .engine
        .create_instance(instance, request.actor.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_instance_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Instance>> {
    let instance = state.engine.stores().instances.load(&id).await?.value;
    Ok(Json(instance))
}

/// Recent output of the instance's workload
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEvent>>> {
    let mut options = LogOptions::default();
    if let Some(tail) = query.tail {
        options.tail = tail;
    }
    options.since = query.since;
    let events = state.engine.logs(&id, &options).await?;
    Ok(Json(events))
}

pub async fn reconcile_all_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state.engine.reconcile_all(query.actor.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Reconcile one instance now and return the outcome
pub async fn reconcile_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state
        .engine
        .request_reconcile(&id, query.actor.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Pause a running instance. The actor comes from `?actor=`
pub async fn pause_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.engine.pause(&id, query.actor.as_deref()).await?))
}

pub async fn resume_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.engine.resume(&id, query.actor.as_deref()).await?))
}

pub async fn drain_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.engine.drain(&id, query.actor.as_deref()).await?))
}

pub async fn requeue_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.engine.requeue(&id, query.actor.as_deref()).await?))
}

/// Mark an instance for teardown
pub async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.engine.delete(&id, query.actor.as_deref()).await?;
    Ok((StatusCode::ACCEPTED, Json(instance)))
}

/// Promote the instances of a change-set to the next environment
pub async fn promote_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state
        .rollout
        .promote(&id, &request.target_environment, request.actor.as_deref())
        .await?;
    Ok(Json(response))
}

// =============================== SECRETS ================================= //

/// Store a secret. The response never carries the value
pub async fn put_secret_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, key)): Path<(String, String)>,
    Json(request): Json<SecretWriteRequest>,
) -> ApiResult<impl IntoResponse> {
    let value = SecretString::from(request.value);
    let descriptor = state.vault.store_secret(&id, &key, &value).await?;
    Ok(Json(descriptor))
}

pub async fn get_secret_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<Json<SecretValueResponse>> {
    match state.vault.get_secret(&id, &key).await? {
        Some(value) => Ok(Json(SecretValueResponse {
            instance_id: id,
            key,
            value: value.expose_secret().to_string(),
        })),
        None => Err(FleetError::NotFound(format!("secret {} of instance {}", key, id)).into()),
    }
}

pub async fn delete_secret_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.vault.delete_secret(&id, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================== CHANGE SETS ============================== //

pub async fn create_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateChangeSetRequest>,
) -> ApiResult<(StatusCode, Json<ChangeSet>)> {
    let change_set = state.rollout.create(request).await?;
    Ok((StatusCode::CREATED, Json(change_set)))
}

pub async fn get_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChangeSet>> {
    Ok(Json(state.rollout.get(&id).await?))
}

pub async fn start_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<ChangeSet>> {
    Ok(Json(state.rollout.start(&id, query.actor.as_deref()).await?))
}

pub async fn progress_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<ProgressUpdateRequest>,
) -> ApiResult<Json<ChangeSet>> {
    let change_set = state
        .rollout
        .update_progress(&id, request.updated, request.failed)
        .await?;
    Ok(Json(change_set))
}

pub async fn rollback_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> ApiResult<(StatusCode, Json<ChangeSet>)> {
    let rollback = state
        .rollout
        .rollback(&id, &request.reason, request.actor.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(rollback)))
}

/// Run a change-set to completion inside the request
pub async fn execute_change_set_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<ActorRequest>,
) -> ApiResult<Json<ChangeSet>> {
    Ok(Json(state.rollout.execute(&id, query.actor.as_deref()).await?))
}

// ============================= PROVISIONING ============================== //

/// Current snapshot, or the `unknown` sentinel when nothing is recorded
pub async fn provisioning_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Json<ProvisioningProgress> {
    Json(state.progress.status(&id).await)
}
