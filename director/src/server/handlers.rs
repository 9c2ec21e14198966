//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::errors::DirectorError;
use crate::models::Container;
use crate::mqtt::topics::Notification;
use crate::reconcile::needs_update;
use crate::server::state::ServerState;
use crate::utils::version_info;

fn internal_error(e: DirectorError) -> StatusCode {
    error!("Request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "supercompose-director".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
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

/// Supervised nodes per workload
#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub reconcile: Vec<Uuid>,
    pub container_sync: Vec<Uuid>,
}

pub async fn nodes_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(NodesResponse {
        reconcile: state.reconcile.running_nodes().await,
        container_sync: state.container_sync.running_nodes().await,
    })
}

/// Deployment status as seen by the engine right now
#[derive(Debug, Serialize)]
pub struct DeploymentStatus {
    pub deployment_id: Uuid,
    pub compose_id: Uuid,
    pub compose_name: String,
    pub enabled: bool,
    pub reconciliation_failed: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub current_version_id: Uuid,
    pub last_deployed_version_id: Option<Uuid>,
    pub needs_update: bool,
}

pub async fn node_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    if state.store.get_node(node_id).await.map_err(internal_error)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let now = Utc::now();
    let deployments: Vec<DeploymentStatus> = state
        .store
        .node_deployments(node_id)
        .await
        .map_err(internal_error)?
        .iter()
        .map(|s| DeploymentStatus {
            deployment_id: s.deployment.id,
            compose_id: s.compose.id,
            compose_name: s.compose.name.clone(),
            enabled: s.deployment.enabled,
            reconciliation_failed: s.deployment.reconciliation_failed,
            last_check: s.deployment.last_check,
            current_version_id: s.current.id,
            last_deployed_version_id: s.last_deployed.as_ref().map(|v| v.id),
            needs_update: needs_update(s, now),
        })
        .collect();

    Ok(Json(deployments))
}

pub async fn deployment_containers_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<Uuid>,
) -> Result<Json<Vec<Container>>, StatusCode> {
    if state
        .store
        .get_deployment(deployment_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let containers = state
        .store
        .deployment_containers(&[deployment_id])
        .await
        .map_err(internal_error)?;
    Ok(Json(containers))
}

pub async fn node_changed_handler(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<Uuid>,
) -> StatusCode {
    state.sinks.dispatch(Notification::NodeChanged(node_id)).await;
    StatusCode::ACCEPTED
}

pub async fn node_info_handler(
    State(state): State<Arc<ServerState>>,
    Path(node_id): Path<Uuid>,
) -> StatusCode {
    state.sinks.dispatch(Notification::NodeInfo(node_id)).await;
    StatusCode::ACCEPTED
}
