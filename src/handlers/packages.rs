use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::{ApiError, ListQuery, find_adapter, run};
use crate::AppState;
use crate::models::PackageUpload;

pub async fn list_packages(
    State(state): State<AppState>,
    Path(adapter): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let filter = query.into_filter()?;
    let packages = run(&state, |ctx| async move { adapter.list_packages(&ctx, &filter).await }).await?;
    Ok(Json(serde_json::json!({ "packages": packages })))
}

pub async fn get_package(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let package = run(&state, |ctx| async move { adapter.get_package(&ctx, &id).await }).await?;
    Ok(Json(package))
}

pub async fn upload_package(
    State(state): State<AppState>,
    Path(adapter): Path<String>,
    Json(upload): Json<PackageUpload>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    let package = run(&state, |ctx| async move { adapter.upload_package(&ctx, &upload).await }).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

pub async fn delete_package(
    State(state): State<AppState>,
    Path((adapter, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &adapter)?;
    run(&state, |ctx| async move { adapter.delete_package(&ctx, &id).await }).await?;
    Ok(StatusCode::NO_CONTENT)
}
