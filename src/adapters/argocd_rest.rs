//! ArgoCD through the API server's REST interface.
//!
//! Superseded by [`super::ArgocdAdapter`], which talks to the cluster
//! directly. Kept for installations that only expose the ArgoCD API server.
//! Application objects have the same shape on both paths, so the mapping
//! helpers are shared.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;

use super::argocd::{apply_update, build_application, to_deployment, to_history, to_package, to_status, validate_update};
use super::{AdapterKind, DeploymentAdapter, finish_packages, history_index};
use crate::cluster::tree;
use crate::error::{AdapterError, AdapterResult};
use crate::models::{
    Capability, Deployment, DeploymentHistory, DeploymentLogs, DeploymentPackage, DeploymentRequest,
    DeploymentStatusDetail, DeploymentUpdate, Filter, LogOptions, PackageUpload,
};
use crate::runtime::{LazyClient, OpContext, finish_deployments, label_selector};
use crate::validation::{validate_log_options, validate_name, validate_replicas, validate_revision};

const BACKEND: &str = "argocd-rest";

const CAPABILITIES: &[Capability] = &[
    Capability::DeploymentLifecycle,
    Capability::Rollback,
    Capability::GitOps,
    Capability::HealthChecks,
];

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("api server answered {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("api server sent a malformed body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RestError {
    fn is_not_found(&self) -> bool {
        matches!(self, RestError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Thin JSON client for `/api/v1/applications`.
pub struct ArgocdApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    app_namespace: String,
}

impl ArgocdApiClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        app_namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            app_namespace: app_namespace.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/applications{path}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, RestError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| tree::str_at(&v, &["message"]).map(str::to_string))
                .unwrap_or(body);
            return Err(RestError::Status { status, message });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get(&self, name: &str) -> Result<Value, RestError> {
        let request = self
            .http
            .get(self.url(&format!("/{}", urlencoding::encode(name))))
            .query(&[("appNamespace", &self.app_namespace)]);
        self.send(request).await
    }

    pub async fn list(&self, selector: Option<&str>) -> Result<Vec<Value>, RestError> {
        let mut request = self
            .http
            .get(self.url(""))
            .query(&[("appNamespace", &self.app_namespace)]);
        if let Some(selector) = selector {
            request = request.query(&[("selector", selector)]);
        }
        let body = self.send(request).await?;
        Ok(tree::array_at(&body, &["items"]).to_vec())
    }

    pub async fn create(&self, app: &Value) -> Result<Value, RestError> {
        self.send(self.http.post(self.url("")).json(app)).await
    }

    pub async fn update(&self, app: &Value) -> Result<Value, RestError> {
        let name = tree::name(app);
        let request = self
            .http
            .put(self.url(&format!("/{}", urlencoding::encode(&name))))
            .json(app);
        self.send(request).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), RestError> {
        let request = self
            .http
            .delete(self.url(&format!("/{}", urlencoding::encode(name))))
            .query(&[("cascade", "true"), ("appNamespace", self.app_namespace.as_str())]);
        self.send(request).await.map(|_| ())
    }

    /// Native rollback to the history entry with the given id.
    pub async fn rollback(&self, name: &str, history_id: i64) -> Result<(), RestError> {
        let body = json!({ "name": name, "appNamespace": self.app_namespace, "id": history_id, "prune": false });
        let request = self
            .http
            .post(self.url(&format!("/{}/rollback", urlencoding::encode(name))))
            .json(&body);
        self.send(request).await.map(|_| ())
    }

    pub async fn sync(&self, name: &str) -> Result<(), RestError> {
        let body = json!({ "name": name, "appNamespace": self.app_namespace, "prune": true });
        let request = self
            .http
            .post(self.url(&format!("/{}/sync", urlencoding::encode(name))))
            .json(&body);
        self.send(request).await.map(|_| ())
    }

    pub async fn version(&self) -> Result<String, RestError> {
        let request = self.http.get(format!("{}/api/version", self.base_url));
        let body = self.send(request).await?;
        Ok(tree::string_at(&body, &["Version"]))
    }
}

fn rest_error(operation: &'static str, id: &str, err: RestError) -> AdapterError {
    if err.is_not_found() {
        AdapterError::DeploymentNotFound(id.to_string())
    } else {
        AdapterError::backend(BACKEND, operation, id, err)
    }
}

pub struct ArgocdRestAdapter {
    name: String,
    namespace: String,
    client: LazyClient<ArgocdApiClient>,
}

impl ArgocdRestAdapter {
    /// `namespace` must match the one the API client was built for.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, client: LazyClient<ArgocdApiClient>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            client,
        }
    }

    async fn application(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<Value> {
        validate_name("id", id)?;
        let api = self.client.get(ctx).await?;
        api.get(id).await.map_err(|e| rest_error(operation, id, e))
    }

    async fn applications(&self, ctx: &OpContext, selector: Option<&str>) -> AdapterResult<Vec<Value>> {
        let api = self.client.get(ctx).await?;
        api.list(selector)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", "applications", e))
    }
}

#[async_trait]
impl DeploymentAdapter for ArgocdRestAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::ArgocdRest
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn list_packages(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<DeploymentPackage>> {
        ctx.check()?;
        let apps = self.applications(ctx, None).await?;
        Ok(finish_packages(apps.iter().filter_map(to_package).collect(), filter))
    }

    async fn get_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        let apps = self.applications(ctx, None).await?;
        apps.iter()
            .filter_map(to_package)
            .find(|p| p.id == id)
            .ok_or_else(|| AdapterError::PackageNotFound(id.to_string()))
    }

    async fn upload_package(&self, ctx: &OpContext, _upload: &PackageUpload) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        Err(AdapterError::unsupported(
            BACKEND,
            "upload package",
            "packages are the Git repositories applications reference; create a deployment with extensions.repoURL",
        ))
    }

    async fn delete_package(&self, ctx: &OpContext, _id: &str) -> AdapterResult<()> {
        ctx.check()?;
        Err(AdapterError::unsupported(
            BACKEND,
            "delete package",
            "packages are derived from live applications; delete the deployments that reference it",
        ))
    }

    async fn list_deployments(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<Deployment>> {
        ctx.check()?;
        let selector = label_selector(&filter.labels);
        let apps = self.applications(ctx, selector.as_deref()).await?;
        Ok(finish_deployments(apps.iter().map(to_deployment).collect(), filter, true))
    }

    async fn get_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<Deployment> {
        ctx.check()?;
        Ok(to_deployment(&self.application(ctx, "get", id).await?))
    }

    async fn create_deployment(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment> {
        ctx.check()?;
        let app = build_application(&self.namespace, request)?;
        let api = self.client.get(ctx).await?;
        let created = api
            .create(&app)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "create", &request.name, e))?;
        tracing::info!(adapter = %self.name, application = %request.name, "application created");
        Ok(to_deployment(&created))
    }

    async fn update_deployment(
        &self,
        ctx: &OpContext,
        id: &str,
        update: &DeploymentUpdate,
    ) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_update(update)?;
        let mut app = self.application(ctx, "update", id).await?;
        apply_update(&mut app, update);
        let api = self.client.get(ctx).await?;
        let updated = api.update(&app).await.map_err(|e| rest_error("update", id, e))?;
        let mut deployment = to_deployment(&updated);
        // The update is applied; a failed sync only delays reconciliation.
        match api.sync(id).await {
            Ok(()) => {
                tracing::info!(adapter = %self.name, application = %id, "application updated and sync requested")
            }
            Err(e) => {
                tracing::warn!(adapter = %self.name, application = %id, "application updated but sync failed: {e}");
                deployment.extensions.insert("syncError".into(), json!(e.to_string()));
            }
        }
        Ok(deployment)
    }

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        validate_name("id", id)?;
        let api = self.client.get(ctx).await?;
        api.delete(id).await.map_err(|e| rest_error("delete", id, e))?;
        tracing::info!(adapter = %self.name, application = %id, "application deleted");
        Ok(())
    }

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_replicas(replicas)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "scale",
            "the REST variant cannot patch Helm parameters; use the resource-based argocd adapter",
        ))
    }

    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_revision(revision)?;
        let app = self.application(ctx, "rollback", id).await?;
        let history = tree::array_at(&app, &["status", "history"]);
        let entry = &history[history_index(id, revision, history.len())?];
        let history_id = tree::i64_at(entry, &["id"]).ok_or_else(|| {
            AdapterError::malformed(BACKEND, "rollback", id, format!("history entry {revision} has no id"))
        })?;
        let api = self.client.get(ctx).await?;
        api.rollback(id, history_id)
            .await
            .map_err(|e| rest_error("rollback", id, e))?;
        tracing::info!(adapter = %self.name, application = %id, history_id, "rollback requested");
        let current = api.get(id).await.map_err(|e| rest_error("rollback", id, e))?;
        Ok(to_deployment(&current))
    }

    async fn deployment_status(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentStatusDetail> {
        ctx.check()?;
        Ok(to_status(&self.application(ctx, "status", id).await?))
    }

    async fn deployment_history(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentHistory> {
        ctx.check()?;
        Ok(to_history(&self.application(ctx, "history", id).await?))
    }

    async fn deployment_logs(&self, ctx: &OpContext, id: &str, options: &LogOptions) -> AdapterResult<DeploymentLogs> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_log_options(options)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "logs",
            "pod logs need cluster access; use the resource-based argocd adapter",
        ))
    }

    async fn health(&self, ctx: &OpContext) -> AdapterResult<()> {
        ctx.check()?;
        let api = self.client.get(ctx).await?;
        api.version()
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::backend(BACKEND, "health", &api.base_url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::DeploymentStatus;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn application(name: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": "argocd", "creationTimestamp": "2024-01-01T00:00:00Z" },
            "spec": {
                "source": { "repoURL": "https://git.example.com/apps.git", "path": "web", "targetRevision": "main" },
                "destination": { "namespace": "prod" }
            },
            "status": {
                "health": { "status": "Healthy" },
                "sync": { "status": "Synced" },
                "history": [
                    { "id": 7, "revision": "a1", "deployedAt": "2024-01-01T10:00:00Z" },
                    { "id": 8, "revision": "b2", "deployedAt": "2024-01-02T10:00:00Z" }
                ]
            }
        })
    }

    fn adapter(server: &MockServer) -> ArgocdRestAdapter {
        let api = ArgocdApiClient::new(server.uri(), "secret", "argocd", Duration::from_secs(5)).unwrap();
        ArgocdRestAdapter::new("argo-rest", "argocd", LazyClient::ready(BACKEND, Arc::new(api)))
    }

    #[tokio::test]
    async fn get_maps_application_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/web"))
            .and(header("authorization", "Bearer secret"))
            .and(query_param("appNamespace", "argocd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .mount(&server)
            .await;

        let deployment = adapter(&server).get_deployment(&OpContext::new(), "web").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Deployed);
        assert_eq!(deployment.version, 2);
    }

    #[tokio::test]
    async fn not_found_maps_to_deployment_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/ghost"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "message": "applications.argoproj.io \"ghost\" not found" })),
            )
            .mount(&server)
            .await;

        let err = adapter(&server).get_deployment(&OpContext::new(), "ghost").await.unwrap_err();
        assert!(matches!(err, AdapterError::DeploymentNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn rollback_uses_history_entry_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications/web/rollback"))
            .and(body_partial_json(json!({ "id": 7 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        adapter.rollback_deployment(&OpContext::new(), "web", 0).await.unwrap();

        let err = adapter.rollback_deployment(&OpContext::new(), "web", 2).await.unwrap_err();
        assert!(matches!(err, AdapterError::RevisionNotFound { available: 2, .. }));
    }

    #[tokio::test]
    async fn update_requests_a_sync() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/applications/web"))
            .and(body_partial_json(json!({ "spec": { "source": { "targetRevision": "v2" } } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications/web/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let update = DeploymentUpdate {
            extensions: [("targetRevision".to_string(), json!("v2"))].into(),
            ..Default::default()
        };
        adapter(&server)
            .update_deployment(&OpContext::new(), "web", &update)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_sync_does_not_fail_an_applied_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/applications/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(application("web")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/applications/web/sync"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "repository unreachable" })))
            .mount(&server)
            .await;

        let update = DeploymentUpdate {
            extensions: [("targetRevision".to_string(), json!("v2"))].into(),
            ..Default::default()
        };
        let updated = adapter(&server)
            .update_deployment(&OpContext::new(), "web", &update)
            .await
            .unwrap();
        assert_eq!(updated.id, "web");
        assert!(updated.extensions["syncError"].as_str().unwrap().contains("repository unreachable"));
    }

    #[tokio::test]
    async fn non_json_success_body_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications/web"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy login</html>"))
            .mount(&server)
            .await;

        let err = adapter(&server).get_deployment(&OpContext::new(), "web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn list_reads_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/applications"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "items": [application("b"), application("a")] })),
            )
            .mount(&server)
            .await;

        let listed = adapter(&server)
            .list_deployments(&OpContext::new(), &Filter::default())
            .await
            .unwrap();
        assert_eq!(listed.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
    }

    #[tokio::test]
    async fn scale_and_logs_are_unsupported() {
        let server = MockServer::start().await;
        let adapter = adapter(&server);
        let ctx = OpContext::new();
        assert_eq!(
            adapter.scale_deployment(&ctx, "web", 2).await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            adapter.scale_deployment(&ctx, "web", -2).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            adapter
                .deployment_logs(&ctx, "web", &LogOptions::default())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Unsupported
        );
    }
}
