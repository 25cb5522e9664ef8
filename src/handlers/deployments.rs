use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use super::{ApiError, ListQuery, find_adapter, run};
use crate::AppState;
use crate::models::{DeploymentRequest, DeploymentUpdate, LogOptions};

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: i32,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    /// Index into the deployment history, oldest first.
    pub revision: i64,
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Path(adapter): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let filter = query.into_filter()?;
    let deployments = run(&state, |ctx| async move { adapter.list_deployments(&ctx, &filter).await }).await?;
    Ok(Json(serde_json::json!({ "deployments": deployments })))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let deployment = run(&state, |ctx| async move { adapter.get_deployment(&ctx, &id).await }).await?;
    Ok(Json(deployment))
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Path(adapter): Path<String>,
    Json(req): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let deployment = run(&state, |ctx| async move { adapter.create_deployment(&ctx, &req).await }).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn update_deployment(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
    Json(req): Json<DeploymentUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let deployment = run(&state, |ctx| async move { adapter.update_deployment(&ctx, &id, &req).await }).await?;
    Ok(Json(deployment))
}

pub async fn delete_deployment(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    run(&state, |ctx| async move { adapter.delete_deployment(&ctx, &id).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn scale_deployment(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
    Json(req): Json<ScaleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let deployment = run(&state, |ctx| async move {
        adapter.scale_deployment(&ctx, &id, req.replicas).await
    })
    .await?;
    Ok(Json(deployment))
}

/// Accepted once the desired state is written; the backend reconciles afterwards.
pub async fn rollback_deployment(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let deployment = run(&state, |ctx| async move {
        adapter.rollback_deployment(&ctx, &id, req.revision).await
    })
    .await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn deployment_status(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let status = run(&state, |ctx| async move { adapter.deployment_status(&ctx, &id).await }).await?;
    Ok(Json(status))
}

pub async fn deployment_history(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let history = run(&state, |ctx| async move { adapter.deployment_history(&ctx, &id).await }).await?;
    Ok(Json(history))
}

pub async fn deployment_logs(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
    Query(options): Query<LogOptions>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let logs = run(&state, |ctx| async move { adapter.deployment_logs(&ctx, &id, &options).await }).await?;
    Ok(Json(logs))
}
