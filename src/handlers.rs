pub mod adapters;
pub mod deployments;
pub mod health;
pub mod packages;

use axum::http::StatusCode;
use axum::{Router, routing::get, routing::post};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::adapters::DeploymentAdapter;
use crate::error::{AdapterError, AdapterResult, ErrorKind};
use crate::models::{DeploymentStatus, Filter};
use crate::runtime::OpContext;

pub type ApiError = (StatusCode, String);

/// Query string of list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub status: Option<DeploymentStatus>,
    /// Label selector, `key=value` pairs separated by commas.
    pub labels: Option<String>,
    /// Resource kind for backends managing more than one (`kustomization`, `helmrelease`).
    pub kind: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<Filter, ApiError> {
        let mut filter = Filter {
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            status: self.status,
            limit: self.limit,
            offset: self.offset,
            ..Default::default()
        };
        for pair in self.labels.iter().flat_map(|l| l.split(',')).filter(|p| !p.trim().is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err((StatusCode::BAD_REQUEST, format!("invalid label selector {pair:?}, expected key=value")));
            };
            filter.labels.insert(key.trim().to_string(), value.trim().to_string());
        }
        if let Some(kind) = self.kind {
            filter.extensions.insert("kind".into(), serde_json::Value::String(kind));
        }
        Ok(filter)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/adapters", get(adapters::list_adapters))
        .route("/api/v1/adapters/{adapter}", get(adapters::get_adapter))
        .route("/api/v1/adapters/{adapter}/health", get(adapters::adapter_health))
        // Packages
        .route(
            "/api/v1/adapters/{adapter}/packages",
            get(packages::list_packages).post(packages::upload_package),
        )
        .route(
            "/api/v1/adapters/{adapter}/packages/{id}",
            get(packages::get_package).delete(packages::delete_package),
        )
        // Deployments
        .route(
            "/api/v1/adapters/{adapter}/deployments",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}",
            get(deployments::get_deployment)
                .put(deployments::update_deployment)
                .delete(deployments::delete_deployment),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}/scale",
            post(deployments::scale_deployment),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}/rollback",
            post(deployments::rollback_deployment),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}/status",
            get(deployments::deployment_status),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}/history",
            get(deployments::deployment_history),
        )
        .route(
            "/api/v1/adapters/{adapter}/deployments/{id}/logs",
            get(deployments::deployment_logs),
        )
        // Health
        .route("/healthz", get(health::healthz))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::Backend => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub(crate) fn api_error(err: AdapterError) -> ApiError {
    let status = status_of(err.kind());
    if status.is_server_error() && err.kind() != ErrorKind::Unsupported {
        tracing::warn!("request failed: {err}");
    }
    (status, err.to_string())
}

pub(crate) fn find_adapter(state: &AppState, name: &str) -> Result<Arc<dyn DeploymentAdapter>, ApiError> {
    state
        .registry
        .get(name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("adapter not found: {name}")))
}

/// Runs one adapter operation under the configured deadline. When the
/// deadline passes the operation's context is cancelled and the request
/// fails with 503.
pub(crate) async fn run<T, F, Fut>(state: &AppState, operation: F) -> Result<T, ApiError>
where
    F: FnOnce(OpContext) -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let ctx = OpContext::new();
    let work = operation(ctx.clone());
    let outcome = match state.request_timeout {
        Some(limit) => tokio::select! {
            outcome = work => outcome,
            _ = tokio::time::sleep(limit) => {
                ctx.token().cancel();
                tracing::warn!("operation exceeded {limit:?}, cancelled");
                Err(AdapterError::Cancelled)
            }
        },
        None => work.await,
    };
    outcome.map_err(api_error)
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::*;
    use std::time::Duration;

    #[test]
    fn list_query_builds_filter() {
        let query = ListQuery {
            namespace: Some("prod".into()),
            labels: Some("team=web, tier=front".into()),
            kind: Some("helmrelease".into()),
            limit: 10,
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.namespace.as_deref(), Some("prod"));
        assert_eq!(filter.labels.get("tier").map(String::as_str), Some("front"));
        assert_eq!(filter.extensions["kind"], "helmrelease");
        assert_eq!(filter.limit, 10);

        let bad = ListQuery {
            labels: Some("team".into()),
            ..Default::default()
        };
        assert_eq!(bad.into_filter().unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        assert_eq!(status_of(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ErrorKind::Unsupported), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_of(ErrorKind::Backend), StatusCode::BAD_GATEWAY);
        assert_eq!(status_of(ErrorKind::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn deadline_cancels_the_operation() {
        let state = state_with(vec![Arc::new(StalledAdapter)], Some(Duration::from_millis(20)));
        let response = send(state, "GET", "/api/v1/adapters/stalled/deployments/web", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_adapter_is_not_found() {
        let (_, state) = argo_state();
        let response = send(state, "GET", "/api/v1/adapters/spinnaker/deployments", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (_, state) = argo_state();
        let response = send(state, "GET", "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }
}
