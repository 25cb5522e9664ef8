//! ArgoCD through `Application` custom resources.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::{
    AdapterKind, DeploymentAdapter, deployment_error, finish_packages, history_index, log_entries,
};
use crate::cluster::{ResourceClient, ResourceKind, tree};
use crate::error::{AdapterError, AdapterResult};
use crate::models::{
    Capability, Deployment, DeploymentHistory, DeploymentLogs, DeploymentPackage, DeploymentRequest,
    DeploymentRevision, DeploymentStatus, DeploymentStatusDetail, DeploymentUpdate, Extensions, Filter,
    LogOptions, PackageType, PackageUpload,
};
use crate::runtime::{LazyClient, OpContext, derive_package_id, finish_deployments, label_selector};
use crate::status::argocd::{AppSignals, evaluate};
use crate::validation::{
    optional_bool, optional_str, required_str, validate_log_options, validate_name, validate_path,
    validate_replicas, validate_revision,
};

const BACKEND: &str = "argocd";

pub(crate) const FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";
pub(crate) const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";
pub(crate) const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const DEFAULT_DESTINATION: &str = "https://kubernetes.default.svc";
const REPLICA_PARAMETER: &str = "replicaCount";

const CAPABILITIES: &[Capability] = &[
    Capability::DeploymentLifecycle,
    Capability::Rollback,
    Capability::Scaling,
    Capability::GitOps,
    Capability::HealthChecks,
];

const STATUS_FIELDS: &[(&str, &[&str])] = &[
    ("health", &["status", "health", "status"]),
    ("sync", &["status", "sync", "status"]),
    ("syncRevision", &["status", "sync", "revision"]),
    ("operationPhase", &["status", "operationState", "phase"]),
    ("project", &["spec", "project"]),
];

pub fn application_kind() -> ResourceKind {
    ResourceKind::namespaced("argoproj.io", "v1alpha1", "Application", "applications")
}

/// Where an Application pulls its manifests from.
pub(crate) struct AppSource<'a> {
    pub repo_url: &'a str,
    pub path: &'a str,
    pub chart: &'a str,
    pub target_revision: &'a str,
    pub helm: bool,
}

impl<'a> AppSource<'a> {
    pub fn of(app: &'a Value) -> Self {
        let source = |field: &str| tree::str_at(app, &["spec", "source", field]).unwrap_or_default();
        let chart = source("chart");
        Self {
            repo_url: source("repoURL"),
            path: source("path"),
            chart,
            target_revision: source("targetRevision"),
            helm: !chart.is_empty() || tree::lookup(app, &["spec", "source", "helm"]).is_some(),
        }
    }

    fn package_type(&self) -> PackageType {
        if self.chart.is_empty() {
            PackageType::GitRepository
        } else {
            PackageType::HelmChart
        }
    }

    fn locator(&self) -> &'a str {
        if self.chart.is_empty() { self.path } else { self.chart }
    }

    pub fn package_id(&self) -> String {
        derive_package_id(self.package_type(), self.repo_url, self.locator())
    }
}

pub(crate) fn to_deployment(app: &Value) -> Deployment {
    let source = AppSource::of(app);
    let verdict = evaluate(&AppSignals::from_application(app));
    let created_at = tree::created_at(app).unwrap_or_else(Utc::now);
    let updated_at = tree::time_at(app, &["status", "reconciledAt"])
        .or_else(|| tree::time_at(app, &["status", "operationState", "finishedAt"]))
        .unwrap_or(created_at);

    let mut extensions = Extensions::new();
    for (key, path) in STATUS_FIELDS {
        if let Some(value) = tree::str_at(app, path) {
            extensions.insert(key.to_string(), json!(value));
        }
    }
    for (key, value) in [
        ("repoURL", source.repo_url),
        ("path", source.path),
        ("chart", source.chart),
        ("targetRevision", source.target_revision),
    ] {
        if !value.is_empty() {
            extensions.insert(key.to_string(), json!(value));
        }
    }

    Deployment {
        id: tree::name(app),
        name: tree::name(app),
        package_id: source.package_id(),
        namespace: tree::string_at(app, &["spec", "destination", "namespace"]),
        status: verdict.status,
        version: tree::array_at(app, &["status", "history"]).len() as i64,
        description: verdict.message,
        created_at,
        updated_at,
        labels: tree::labels(app),
        extensions,
    }
}

/// Packages are the Git sources and charts that Applications point at.
pub(crate) fn to_package(app: &Value) -> Option<DeploymentPackage> {
    let source = AppSource::of(app);
    if source.repo_url.is_empty() {
        return None;
    }
    let name = match source.locator().rsplit('/').find(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => repository_name(source.repo_url),
    };
    let mut extensions = Extensions::new();
    extensions.insert("repoURL".into(), json!(source.repo_url));
    if !source.locator().is_empty() {
        extensions.insert(
            if source.chart.is_empty() { "path" } else { "chart" }.into(),
            json!(source.locator()),
        );
    }
    Some(DeploymentPackage {
        id: source.package_id(),
        name,
        version: if source.target_revision.is_empty() {
            "HEAD".to_string()
        } else {
            source.target_revision.to_string()
        },
        package_type: source.package_type(),
        description: format!("source of application {}", tree::name(app)),
        uploaded_at: tree::created_at(app).unwrap_or_else(Utc::now),
        extensions,
    })
}

pub(crate) fn repository_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

pub(crate) fn to_status(app: &Value) -> DeploymentStatusDetail {
    let verdict = evaluate(&AppSignals::from_application(app));
    let conditions = tree::conditions(app);
    let updated_at = tree::time_at(app, &["status", "reconciledAt"])
        .or_else(|| tree::last_transition(&conditions))
        .unwrap_or_else(Utc::now);
    let mut extensions = Extensions::new();
    for (key, path) in STATUS_FIELDS {
        if let Some(value) = tree::str_at(app, path) {
            extensions.insert(key.to_string(), json!(value));
        }
    }
    DeploymentStatusDetail {
        id: tree::name(app),
        status: verdict.status,
        message: verdict.message,
        progress: verdict.progress,
        conditions,
        updated_at,
        extensions,
    }
}

/// `status.history` is appended by the controller after every sync, oldest first.
pub(crate) fn to_history(app: &Value) -> DeploymentHistory {
    let created_at = tree::created_at(app).unwrap_or_else(Utc::now);
    let revisions = tree::array_at(app, &["status", "history"])
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let revision = tree::string_at(entry, &["revision"]);
            DeploymentRevision {
                revision: index as i64,
                description: format!("sync {} of revision {revision}", tree::i64_at(entry, &["id"]).unwrap_or(index as i64)),
                version: revision,
                deployed_at: tree::time_at(entry, &["deployedAt"]).unwrap_or(created_at),
                status: DeploymentStatus::Deployed,
            }
        })
        .collect();
    DeploymentHistory {
        deployment_id: tree::name(app),
        revisions,
    }
}

/// Validates a create request and renders the Application object.
pub(crate) fn build_application(app_namespace: &str, request: &DeploymentRequest) -> AdapterResult<Value> {
    validate_name("name", &request.name)?;
    validate_name("namespace", &request.namespace)?;
    let ext = &request.extensions;
    let repo_url = required_str(ext, "repoURL")?;
    let path = optional_str(ext, "path")?.unwrap_or_default();
    validate_path("extensions.path", path)?;
    let chart = optional_str(ext, "chart")?;
    let target_revision = optional_str(ext, "targetRevision")?.unwrap_or("HEAD");
    let project = optional_str(ext, "project")?.unwrap_or("default");
    let server = optional_str(ext, "destinationServer")?.unwrap_or(DEFAULT_DESTINATION);
    let automated = optional_bool(ext, "automated")?.unwrap_or(true);

    let mut source = json!({
        "repoURL": repo_url,
        "targetRevision": target_revision,
    });
    match chart {
        Some(chart) => tree::set_at(&mut source, &["chart"], json!(chart)),
        None => tree::set_at(&mut source, &["path"], json!(path)),
    }
    if chart.is_some() || !request.values.is_empty() {
        tree::set_at(&mut source, &["helm", "valuesObject"], json!(request.values));
    }

    let mut app = json!({
        "apiVersion": application_kind().api_version(),
        "kind": "Application",
        "metadata": {
            "name": request.name,
            "namespace": app_namespace,
            "labels": request.labels,
            "finalizers": [FINALIZER],
        },
        "spec": {
            "project": project,
            "source": source,
            "destination": {
                "server": server,
                "namespace": request.namespace,
            },
            "syncPolicy": {
                "syncOptions": ["CreateNamespace=true"],
            },
        },
    });
    if automated {
        tree::set_at(
            &mut app,
            &["spec", "syncPolicy", "automated"],
            json!({ "prune": true, "selfHeal": true }),
        );
    }
    Ok(app)
}

pub(crate) fn validate_update(update: &DeploymentUpdate) -> AdapterResult<()> {
    if let Some(path) = optional_str(&update.extensions, "path")? {
        validate_path("extensions.path", path)?;
    }
    optional_str(&update.extensions, "repoURL")?;
    optional_str(&update.extensions, "targetRevision")?;
    Ok(())
}

/// Merges values, labels and source overrides into the desired state.
pub(crate) fn apply_update(app: &mut Value, update: &DeploymentUpdate) {
    for (key, value) in &update.values {
        tree::set_at(app, &["spec", "source", "helm", "valuesObject", key.as_str()], value.clone());
    }
    for (key, value) in &update.labels {
        tree::set_at(app, &["metadata", "labels", key.as_str()], json!(value));
    }
    for field in ["repoURL", "path", "targetRevision"] {
        if let Some(Value::String(value)) = update.extensions.get(field) {
            if !value.trim().is_empty() {
                tree::set_at(app, &["spec", "source", field], json!(value));
            }
        }
    }
}

/// Sets the `replicaCount` Helm parameter, replacing an existing one.
pub(crate) fn set_replicas(app: &mut Value, replicas: i32) -> AdapterResult<()> {
    if !AppSource::of(app).helm {
        return Err(AdapterError::unsupported(
            BACKEND,
            "scale",
            "application renders a plain directory source; change the replica count in Git instead",
        ));
    }
    let mut parameters: Vec<Value> = tree::array_at(app, &["spec", "source", "helm", "parameters"])
        .iter()
        .filter(|p| tree::str_at(p, &["name"]) != Some(REPLICA_PARAMETER))
        .cloned()
        .collect();
    parameters.push(json!({ "name": REPLICA_PARAMETER, "value": replicas.to_string() }));
    tree::set_at(app, &["spec", "source", "helm", "parameters"], Value::Array(parameters));
    Ok(())
}

pub struct ArgocdAdapter {
    name: String,
    namespace: String,
    client: LazyClient<dyn ResourceClient>,
}

impl ArgocdAdapter {
    /// `namespace` is where the Application objects live, usually `argocd`.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, client: LazyClient<dyn ResourceClient>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            client,
        }
    }

    async fn application(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<Value> {
        validate_name("id", id)?;
        let client = self.client.get(ctx).await?;
        client
            .get(&application_kind(), &self.namespace, id)
            .await
            .map_err(|e| deployment_error(BACKEND, operation, id, e))
    }

    async fn write(&self, ctx: &OpContext, operation: &'static str, app: Value) -> AdapterResult<Deployment> {
        let id = tree::name(&app);
        let client = self.client.get(ctx).await?;
        let updated = client
            .update(&application_kind(), &self.namespace, app)
            .await
            .map_err(|e| deployment_error(BACKEND, operation, &id, e))?;
        Ok(to_deployment(&updated))
    }

    async fn applications(&self, ctx: &OpContext, selector: Option<&str>) -> AdapterResult<Vec<Value>> {
        let client = self.client.get(ctx).await?;
        client
            .list(&application_kind(), Some(&self.namespace), selector)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", &self.namespace, e))
    }
}

#[async_trait]
impl DeploymentAdapter for ArgocdAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Argocd
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
        let client = self.client.get(ctx).await?;
        let created = client
            .create(&application_kind(), &self.namespace, app)
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
        let deployment = self.write(ctx, "update", app).await?;
        tracing::info!(adapter = %self.name, application = %id, "application updated");
        Ok(deployment)
    }

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        validate_name("id", id)?;
        let client = self.client.get(ctx).await?;
        client
            .delete(&application_kind(), &self.namespace, id)
            .await
            .map_err(|e| deployment_error(BACKEND, "delete", id, e))?;
        tracing::info!(adapter = %self.name, application = %id, "application deleted");
        Ok(())
    }

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_replicas(replicas)?;
        let mut app = self.application(ctx, "scale", id).await?;
        set_replicas(&mut app, replicas)?;
        let deployment = self.write(ctx, "scale", app).await?;
        tracing::info!(adapter = %self.name, application = %id, replicas, "application scaled");
        Ok(deployment)
    }

    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_revision(revision)?;
        let mut app = self.application(ctx, "rollback", id).await?;
        let history = tree::array_at(&app, &["status", "history"]);
        let entry = &history[history_index(id, revision, history.len())?];
        let target = tree::string_at(entry, &["revision"]);
        if target.is_empty() {
            return Err(AdapterError::malformed(
                BACKEND,
                "rollback",
                id,
                format!("history entry {revision} carries no source revision"),
            ));
        }
        tree::set_at(&mut app, &["spec", "source", "targetRevision"], json!(target));
        tree::set_at(&mut app, &["metadata", "annotations", REFRESH_ANNOTATION], json!("hard"));
        let deployment = self.write(ctx, "rollback", app).await?;
        tracing::info!(adapter = %self.name, application = %id, %target, "application pinned to earlier revision");
        Ok(deployment)
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
        validate_log_options(options)?;
        let app = self.application(ctx, "logs", id).await?;
        let target_namespace = tree::string_at(&app, &["spec", "destination", "namespace"]);
        let selector = format!("{INSTANCE_LABEL}={id}");
        let client = self.client.get(ctx).await?;
        let logs = client
            .pod_logs(&target_namespace, &selector, options.container.as_deref(), options.tail_lines)
            .await
            .map_err(|e| deployment_error(BACKEND, "logs", id, e))?;
        Ok(log_entries(id, logs))
    }

    async fn health(&self, ctx: &OpContext) -> AdapterResult<()> {
        ctx.check()?;
        let client = self.client.get(ctx).await?;
        client
            .ping()
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "health", "cluster", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PodLog;
    use crate::cluster::memory::MemoryResourceClient;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn adapter() -> (Arc<MemoryResourceClient>, ArgocdAdapter) {
        let memory = Arc::new(MemoryResourceClient::new());
        let client: Arc<dyn ResourceClient> = memory.clone();
        let adapter = ArgocdAdapter::new("argo", "argocd", LazyClient::ready(BACKEND, client));
        (memory, adapter)
    }

    fn app(name: &str, health: &str, sync: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": "argocd", "labels": { "team": "web" } },
            "spec": {
                "project": "default",
                "source": { "repoURL": "https://git.example.com/apps.git", "path": "web", "targetRevision": "main" },
                "destination": { "server": DEFAULT_DESTINATION, "namespace": "prod" }
            },
            "status": {
                "health": { "status": health },
                "sync": { "status": sync, "revision": "c3" },
                "history": [
                    { "id": 1, "revision": "a1", "deployedAt": "2024-01-01T10:00:00Z" },
                    { "id": 2, "revision": "b2", "deployedAt": "2024-01-02T10:00:00Z" },
                    { "id": 3, "revision": "c3", "deployedAt": "2024-01-03T10:00:00Z" }
                ]
            }
        })
    }

    fn request(name: &str) -> DeploymentRequest {
        DeploymentRequest {
            name: name.into(),
            namespace: "prod".into(),
            extensions: [("repoURL".to_string(), json!("https://git.example.com/apps.git"))].into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_renders_application() {
        let (memory, adapter) = adapter();
        let mut req = request("web");
        req.values.insert("image".into(), json!("nginx:1.25"));
        req.extensions.insert("path".into(), json!("apps/web"));

        let created = adapter.create_deployment(&OpContext::new(), &req).await.unwrap();
        assert_eq!(created.id, "web");
        assert_eq!(created.namespace, "prod");
        assert_eq!(created.status, DeploymentStatus::Pending);

        let stored = memory.object(&application_kind(), "argocd", "web").unwrap();
        assert_eq!(tree::str_at(&stored, &["spec", "source", "targetRevision"]), Some("HEAD"));
        assert_eq!(tree::str_at(&stored, &["spec", "source", "path"]), Some("apps/web"));
        assert_eq!(
            tree::str_at(&stored, &["spec", "source", "helm", "valuesObject", "image"]),
            Some("nginx:1.25")
        );
        assert_eq!(tree::array_at(&stored, &["metadata", "finalizers"])[0], json!(FINALIZER));
        assert!(tree::lookup(&stored, &["spec", "syncPolicy", "automated"]).is_some());
    }

    #[tokio::test]
    async fn create_validates_before_calling_the_cluster() {
        let (memory, adapter) = adapter();
        let ctx = OpContext::new();

        let mut no_repo = request("web");
        no_repo.extensions.clear();
        let err = adapter.create_deployment(&ctx, &no_repo).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut traversal = request("web");
        traversal.extensions.insert("path".into(), json!("../etc"));
        let err = adapter.create_deployment(&ctx, &traversal).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = adapter.create_deployment(&ctx, &request("Web_App")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(memory.calls(), 0);
    }

    #[tokio::test]
    async fn healthy_synced_application_is_deployed() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));

        let status = adapter.deployment_status(&OpContext::new(), "web").await.unwrap();
        assert_eq!(status.status, DeploymentStatus::Deployed);
        assert_eq!(status.progress, 100);
        assert_eq!(status.extensions["health"], json!("Healthy"));

        let deployment = adapter.get_deployment(&OpContext::new(), "web").await.unwrap();
        assert_eq!(deployment.version, 3);
        assert_eq!(deployment.extensions["repoURL"], json!("https://git.example.com/apps.git"));
    }

    #[tokio::test]
    async fn missing_application_is_not_found() {
        let (_memory, adapter) = adapter();
        let err = adapter.get_deployment(&OpContext::new(), "ghost").await.unwrap_err();
        assert!(matches!(err, AdapterError::DeploymentNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_pages() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("a", "Healthy", "Synced"));
        memory.seed(&application_kind(), app("b", "Degraded", "Synced"));
        memory.seed(&application_kind(), app("c", "Healthy", "Synced"));
        let ctx = OpContext::new();

        let deployed = adapter
            .list_deployments(&ctx, &Filter::default().with_status(DeploymentStatus::Deployed))
            .await
            .unwrap();
        assert_eq!(deployed.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["a", "c"]);

        let page = adapter
            .list_deployments(&ctx, &Filter::default().with_page(2, 1))
            .await
            .unwrap();
        assert_eq!(page.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["b", "c"]);

        let empty = adapter
            .list_deployments(&ctx, &Filter::default().with_page(10, 3))
            .await
            .unwrap();
        assert!(empty.is_empty());

        let other_team = adapter
            .list_deployments(&ctx, &Filter::default().with_label("team", "api"))
            .await
            .unwrap();
        assert!(other_team.is_empty());
    }

    #[tokio::test]
    async fn rollback_pins_history_revision_and_refreshes() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));

        adapter.rollback_deployment(&OpContext::new(), "web", 1).await.unwrap();
        let stored = memory.object(&application_kind(), "argocd", "web").unwrap();
        assert_eq!(tree::str_at(&stored, &["spec", "source", "targetRevision"]), Some("b2"));
        assert_eq!(
            tree::str_at(&stored, &["metadata", "annotations", REFRESH_ANNOTATION]),
            Some("hard")
        );
    }

    #[tokio::test]
    async fn rollback_past_history_is_revision_not_found() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));

        let err = adapter.rollback_deployment(&OpContext::new(), "web", 5).await.unwrap_err();
        assert!(matches!(err, AdapterError::RevisionNotFound { revision: 5, available: 3, .. }));

        let before = memory.calls();
        let err = adapter.rollback_deployment(&OpContext::new(), "web", -1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(memory.calls(), before);
    }

    #[tokio::test]
    async fn negative_replicas_never_reach_the_cluster() {
        let (memory, adapter) = adapter();
        let err = adapter.scale_deployment(&OpContext::new(), "web", -1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(memory.calls(), 0);
    }

    #[tokio::test]
    async fn scale_sets_helm_parameter_or_is_unsupported() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("plain", "Healthy", "Synced"));
        let mut chart = app("chart", "Healthy", "Synced");
        tree::set_at(&mut chart, &["spec", "source", "chart"], json!("nginx"));
        tree::set_at(
            &mut chart,
            &["spec", "source", "helm", "parameters"],
            json!([{ "name": "replicaCount", "value": "1" }, { "name": "image.tag", "value": "1.25" }]),
        );
        memory.seed(&application_kind(), chart);
        let ctx = OpContext::new();

        let err = adapter.scale_deployment(&ctx, "plain", 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        adapter.scale_deployment(&ctx, "chart", 3).await.unwrap();
        let stored = memory.object(&application_kind(), "argocd", "chart").unwrap();
        let params = tree::array_at(&stored, &["spec", "source", "helm", "parameters"]);
        assert_eq!(params.len(), 2);
        assert!(params.contains(&json!({ "name": "replicaCount", "value": "3" })));
    }

    #[tokio::test]
    async fn packages_are_deduplicated_sources() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("a", "Healthy", "Synced"));
        memory.seed(&application_kind(), app("b", "Healthy", "Synced"));
        let ctx = OpContext::new();

        let packages = adapter.list_packages(&ctx, &Filter::default()).await.unwrap();
        assert_eq!(packages.len(), 1);
        let package = &packages[0];
        assert_eq!(package.package_type, PackageType::GitRepository);
        assert_eq!(package.name, "web");
        assert_eq!(
            package.id,
            derive_package_id(PackageType::GitRepository, "https://git.example.com/apps.git", "web")
        );
        assert_eq!(adapter.get_package(&ctx, &package.id).await.unwrap(), *package);

        let err = adapter.get_package(&ctx, "git-0000").await.unwrap_err();
        assert!(matches!(err, AdapterError::PackageNotFound(_)));
        let err = adapter.upload_package(&ctx, &PackageUpload::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn update_merges_values_and_labels() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));
        let update = DeploymentUpdate {
            values: [("replicaCount".to_string(), json!(4))].into(),
            labels: [("tier".to_string(), "frontend".to_string())].into(),
            extensions: [("targetRevision".to_string(), json!("v2"))].into(),
            ..Default::default()
        };

        let updated = adapter.update_deployment(&OpContext::new(), "web", &update).await.unwrap();
        assert_eq!(updated.labels["team"], "web");
        assert_eq!(updated.labels["tier"], "frontend");
        let stored = memory.object(&application_kind(), "argocd", "web").unwrap();
        assert_eq!(tree::str_at(&stored, &["spec", "source", "targetRevision"]), Some("v2"));
        assert_eq!(
            tree::i64_at(&stored, &["spec", "source", "helm", "valuesObject", "replicaCount"]),
            Some(4)
        );
    }

    #[tokio::test]
    async fn history_is_oldest_first() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));
        let history = adapter.deployment_history(&OpContext::new(), "web").await.unwrap();
        let versions: Vec<_> = history.revisions.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, ["a1", "b2", "c3"]);
        assert_eq!(history.revisions[2].revision, 2);
    }

    #[tokio::test]
    async fn logs_select_pods_by_instance_label() {
        let (memory, adapter) = adapter();
        memory.seed(&application_kind(), app("web", "Healthy", "Synced"));
        memory.set_logs(
            "prod",
            "app.kubernetes.io/instance=web",
            vec![PodLog {
                pod: "web-7d9f".into(),
                container: Some("nginx".into()),
                text: "started\nlistening on :80\n".into(),
            }],
        );
        let logs = adapter
            .deployment_logs(&OpContext::new(), "web", &LogOptions::default())
            .await
            .unwrap();
        assert_eq!(logs.entries.len(), 1);
        assert_eq!(logs.entries[0].lines, ["started", "listening on :80"]);
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_io() {
        let (memory, adapter) = adapter();
        let ctx = OpContext::new();
        ctx.token().cancel();
        let err = adapter.list_deployments(&ctx, &Filter::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(memory.calls(), 0);
    }
}
