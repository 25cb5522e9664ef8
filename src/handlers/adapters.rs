use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;

use super::{ApiError, find_adapter, run};
use crate::AppState;
use crate::adapters::{AdapterKind, DeploymentAdapter};
use crate::models::Capability;

#[derive(Debug, Serialize)]
pub struct AdapterInfo {
    pub name: String,
    pub kind: AdapterKind,
    pub capabilities: &'static [Capability],
}

impl AdapterInfo {
    fn of(adapter: &Arc<dyn DeploymentAdapter>) -> Self {
        Self {
            name: adapter.name().to_string(),
            kind: adapter.kind(),
            capabilities: adapter.capabilities(),
        }
    }
}

pub async fn list_adapters(State(state): State<AppState>) -> impl IntoResponse {
    let adapters: Vec<AdapterInfo> = state.registry.iter().map(AdapterInfo::of).collect();
    Json(serde_json::json!({ "adapters": adapters }))
}

pub async fn get_adapter(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &name)?;
    Ok(Json(AdapterInfo::of(&adapter)))
}

pub async fn adapter_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = find_adapter(&state, &name)?;
    run(&state, |ctx| async move { adapter.health(&ctx).await }).await?;
    Ok(Json(serde_json::json!({ "adapter": name, "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn lists_adapters_with_capabilities() {
        let (_, state) = argo_state();
        let response = send(state, "GET", "/api/v1/adapters", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["adapters"][0]["name"], "argo");
        assert_eq!(body["adapters"][0]["kind"], "argocd");
        let capabilities = body["adapters"][0]["capabilities"].as_array().unwrap();
        assert!(capabilities.iter().any(|c| c == "gitops"));
    }

    #[tokio::test]
    async fn health_probes_the_backend() {
        let (memory, state) = argo_state();
        let response = send(state, "GET", "/api/v1/adapters/argo/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(memory.calls(), 1);
    }
}
