//! Helm releases through the package manager's release actions.
//!
//! Deployment ids are release names. A release is located by listing every
//! namespace, so a name installed in two namespaces is rejected as
//! ambiguous rather than guessed.
//!
//! Helm keeps only the chart's metadata name, which `helm upgrade` cannot
//! resolve without the original reference and repo. The adapter records both
//! in a ConfigMap next to each release it installs and reads them back for
//! upgrades, scaling and installs from a package id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::{AdapterKind, DeploymentAdapter, deployment_error, finish_packages, history_index, log_entries};
use crate::cluster::{ClusterError, ResourceClient, ResourceKind, tree};
use crate::error::{AdapterError, AdapterResult};
use crate::helm::{HelmError, InstallRequest, Release, ReleaseActions, UpgradeRequest};
use crate::models::{
    Capability, Deployment, DeploymentCondition, DeploymentHistory, DeploymentLogs, DeploymentPackage,
    DeploymentRequest, DeploymentRevision, DeploymentStatus, DeploymentStatusDetail, DeploymentUpdate, Extensions,
    Filter, LogOptions, PackageType, PackageUpload,
};
use crate::runtime::{LazyClient, OpContext, derive_package_id, finish_deployments, label_selector};
use crate::status::helm::evaluate;
use crate::validation::{
    optional_str, required_str, validate_log_options, validate_name, validate_replicas, validate_revision,
};

const BACKEND: &str = "helm";

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const REPLICA_VALUE: &str = "replicaCount";

const SOURCE_PREFIX: &str = "wide-deploy-chart-";

const SOURCE_PACKAGE_LABEL: &str = "wide-deploy.io/chart-package";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub(crate) fn source_kind() -> ResourceKind {
    ResourceKind::namespaced("", "v1", "ConfigMap", "configmaps")
}

const CAPABILITIES: &[Capability] = &[
    Capability::DeploymentLifecycle,
    Capability::Rollback,
    Capability::Scaling,
    Capability::HealthChecks,
];

fn release_error(operation: &'static str, id: &str, err: HelmError) -> AdapterError {
    match err {
        HelmError::NotFound(_) => AdapterError::DeploymentNotFound(id.to_string()),
        other => AdapterError::backend(BACKEND, operation, id, other),
    }
}

fn package_id(release: &Release) -> String {
    derive_package_id(PackageType::HelmChart, &release.chart, &release.chart_version)
}

fn release_extensions(release: &Release) -> Extensions {
    let mut extensions = Extensions::new();
    extensions.insert("chart".into(), json!(release.chart));
    extensions.insert("chartVersion".into(), json!(release.chart_version));
    if !release.app_version.is_empty() {
        extensions.insert("appVersion".into(), json!(release.app_version));
    }
    extensions.insert("releaseStatus".into(), json!(release.status.as_str()));
    extensions
}

fn to_deployment(release: &Release) -> Deployment {
    let verdict = evaluate(release.status);
    let updated_at = release.last_deployed.unwrap_or_else(Utc::now);
    Deployment {
        id: release.name.clone(),
        name: release.name.clone(),
        package_id: package_id(release),
        namespace: release.namespace.clone(),
        status: verdict.status,
        version: release.revision,
        description: if release.description.is_empty() {
            verdict.message
        } else {
            release.description.clone()
        },
        created_at: release.first_deployed.unwrap_or(updated_at),
        updated_at,
        labels: BTreeMap::new(),
        extensions: release_extensions(release),
    }
}

/// Where a release's chart is pulled from.
#[derive(Debug, Clone, PartialEq)]
struct ChartSource {
    reference: String,
    repo: Option<String>,
}

impl ChartSource {
    fn from_record(record: &Value) -> Option<Self> {
        let reference = tree::str_at(record, &["data", "chart"]).filter(|c| !c.is_empty())?;
        Some(Self {
            reference: reference.to_string(),
            repo: tree::str_at(record, &["data", "repo"])
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        })
    }

    /// An explicit repo replaces the recorded one.
    fn with_repo(mut self, repo: Option<&str>) -> Self {
        if let Some(repo) = repo {
            self.repo = Some(repo.to_string());
        }
        self
    }
}

fn source_name(release: &str) -> String {
    format!("{SOURCE_PREFIX}{release}")
}

fn source_record(release: &Release, source: &ChartSource) -> Value {
    let mut record = json!({
        "metadata": { "name": source_name(&release.name), "namespace": release.namespace },
        "data": { "chart": source.reference, "version": release.chart_version }
    });
    if let Some(repo) = &source.repo {
        tree::set_at(&mut record, &["data", "repo"], json!(repo));
    }
    tree::set_at(&mut record, &["metadata", "labels", MANAGED_BY_LABEL], json!("wide-deploy-api"));
    tree::set_at(&mut record, &["metadata", "labels", SOURCE_PACKAGE_LABEL], json!(package_id(release)));
    tree::set_at(&mut record, &["metadata", "labels", INSTANCE_LABEL], json!(release.name));
    record
}

fn unknown_source(id: &str) -> AdapterError {
    AdapterError::validation(
        "extensions.chart",
        format!("chart reference of release {id} is unknown; pass extensions.chart and extensions.repo"),
    )
}

fn to_package(release: &Release) -> DeploymentPackage {
    let mut extensions = Extensions::new();
    extensions.insert("chart".into(), json!(release.chart));
    if !release.app_version.is_empty() {
        extensions.insert("appVersion".into(), json!(release.app_version));
    }
    DeploymentPackage {
        id: package_id(release),
        name: release.chart.clone(),
        version: release.chart_version.clone(),
        package_type: PackageType::HelmChart,
        description: format!("chart {} {}", release.chart, release.chart_version),
        uploaded_at: release.first_deployed.or(release.last_deployed).unwrap_or_else(Utc::now),
        extensions,
    }
}

pub struct HelmAdapter {
    name: String,
    releases: LazyClient<dyn ReleaseActions>,
    /// Pod logs and the chart source records.
    cluster: LazyClient<dyn ResourceClient>,
}

impl HelmAdapter {
    pub fn new(
        name: impl Into<String>,
        releases: LazyClient<dyn ReleaseActions>,
        cluster: LazyClient<dyn ResourceClient>,
    ) -> Self {
        Self {
            name: name.into(),
            releases,
            cluster,
        }
    }

    /// Namespace of the release called `id`.
    async fn locate(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<String> {
        validate_name("id", id)?;
        let releases = self.releases.get(ctx).await?;
        let mut namespaces: Vec<String> = releases
            .list(None, None)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, operation, id, e))?
            .into_iter()
            .filter(|r| r.name == id)
            .map(|r| r.namespace)
            .collect();
        match namespaces.len() {
            0 => Err(AdapterError::DeploymentNotFound(id.to_string())),
            1 => Ok(namespaces.remove(0)),
            _ => Err(AdapterError::validation(
                "id",
                format!("release {id} exists in namespaces {}", namespaces.join(", ")),
            )),
        }
    }

    async fn current(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<Release> {
        let namespace = self.locate(ctx, operation, id).await?;
        let releases = self.releases.get(ctx).await?;
        releases
            .status(&namespace, id)
            .await
            .map_err(|e| release_error(operation, id, e))
    }

    async fn installed_charts(&self, ctx: &OpContext) -> AdapterResult<Vec<DeploymentPackage>> {
        let releases = self.releases.get(ctx).await?;
        let listed = releases
            .list(None, None)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", "releases", e))?;
        Ok(listed.iter().map(to_package).collect())
    }

    /// Chart source and version behind a package id, read from the record of
    /// any release installed from it.
    async fn chart_of(&self, ctx: &OpContext, package_id: &str) -> AdapterResult<(ChartSource, String)> {
        let cluster = self.cluster.get(ctx).await?;
        let selector = format!("{SOURCE_PACKAGE_LABEL}={package_id}");
        let records = cluster
            .list(&source_kind(), None, Some(&selector))
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "resolve package", package_id, e))?;
        if let Some((source, record)) = records
            .iter()
            .find_map(|record| ChartSource::from_record(record).map(|source| (source, record)))
        {
            return Ok((source, tree::string_at(record, &["data", "version"])));
        }

        if self.installed_charts(ctx).await?.iter().any(|p| p.id == package_id) {
            return Err(AdapterError::validation(
                "extensions.chart",
                format!("chart reference of package {package_id} is unknown; pass extensions.chart and extensions.repo"),
            ));
        }
        Err(AdapterError::PackageNotFound(package_id.to_string()))
    }

    /// Recorded chart source of a release, `None` when it was installed
    /// outside the gateway.
    async fn recorded_source(
        &self,
        ctx: &OpContext,
        operation: &'static str,
        namespace: &str,
        id: &str,
    ) -> AdapterResult<Option<ChartSource>> {
        let cluster = self.cluster.get(ctx).await?;
        match cluster.get(&source_kind(), namespace, &source_name(id)).await {
            Ok(record) => Ok(ChartSource::from_record(&record)),
            Err(ClusterError::NotFound { .. }) => Ok(None),
            Err(e) => Err(AdapterError::backend(BACKEND, operation, id, e)),
        }
    }

    /// Writes the chart source of `release`. The release itself is already
    /// in place, so a failure here is logged rather than returned.
    async fn remember(&self, ctx: &OpContext, release: &Release, source: &ChartSource) {
        if let Err(e) = self.write_source(ctx, release, source).await {
            tracing::warn!(
                adapter = %self.name,
                release = %release.name,
                "could not record chart source: {e}"
            );
        }
    }

    async fn write_source(&self, ctx: &OpContext, release: &Release, source: &ChartSource) -> AdapterResult<()> {
        let cluster = self.cluster.get(ctx).await?;
        let kind = source_kind();
        let mut record = source_record(release, source);
        let name = source_name(&release.name);
        let outcome = match cluster.get(&kind, &release.namespace, &name).await {
            Ok(existing) => {
                let version = tree::string_at(&existing, &["metadata", "resourceVersion"]);
                tree::set_at(&mut record, &["metadata", "resourceVersion"], json!(version));
                cluster.update(&kind, &release.namespace, record).await
            }
            Err(ClusterError::NotFound { .. }) => cluster.create(&kind, &release.namespace, record).await,
            Err(e) => Err(e),
        };
        outcome
            .map(|_| ())
            .map_err(|e| AdapterError::backend(BACKEND, "record chart source", &release.name, e))
    }

    async fn forget_source(&self, ctx: &OpContext, namespace: &str, id: &str) {
        let cluster = match self.cluster.get(ctx).await {
            Ok(cluster) => cluster,
            Err(e) => {
                tracing::warn!(adapter = %self.name, release = %id, "could not remove chart source: {e}");
                return;
            }
        };
        match cluster.delete(&source_kind(), namespace, &source_name(id)).await {
            Ok(()) | Err(ClusterError::NotFound { .. }) => {}
            Err(e) => tracing::warn!(adapter = %self.name, release = %id, "could not remove chart source: {e}"),
        }
    }

    async fn upgrade(
        &self,
        ctx: &OpContext,
        operation: &'static str,
        request: UpgradeRequest,
        source: &ChartSource,
    ) -> AdapterResult<Deployment> {
        let releases = self.releases.get(ctx).await?;
        let upgraded = releases
            .upgrade(&request)
            .await
            .map_err(|e| release_error(operation, &request.name, e))?;
        tracing::info!(
            adapter = %self.name,
            release = %upgraded.name,
            revision = upgraded.revision,
            "release upgraded ({operation})"
        );
        self.remember(ctx, &upgraded, source).await;
        Ok(to_deployment(&upgraded))
    }
}

#[async_trait]
impl DeploymentAdapter for HelmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Helm
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn list_packages(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<DeploymentPackage>> {
        ctx.check()?;
        Ok(finish_packages(self.installed_charts(ctx).await?, filter))
    }

    async fn get_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        self.installed_charts(ctx)
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| AdapterError::PackageNotFound(id.to_string()))
    }

    async fn upload_package(&self, ctx: &OpContext, upload: &PackageUpload) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        validate_name("name", &upload.name)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "upload package",
            "charts are pulled from their repository; pass chart, version and repo when creating a deployment",
        ))
    }

    async fn delete_package(&self, ctx: &OpContext, _id: &str) -> AdapterResult<()> {
        ctx.check()?;
        Err(AdapterError::unsupported(
            BACKEND,
            "delete package",
            "charts live in their repository; uninstall the releases using the chart instead",
        ))
    }

    async fn list_deployments(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<Deployment>> {
        ctx.check()?;
        let namespace = filter.namespace.as_deref().filter(|ns| !ns.is_empty());
        let selector = label_selector(&filter.labels);
        let releases = self.releases.get(ctx).await?;
        let listed = releases
            .list(namespace, selector.as_deref())
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", "releases", e))?;
        Ok(finish_deployments(listed.iter().map(to_deployment).collect(), filter, true))
    }

    async fn get_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<Deployment> {
        ctx.check()?;
        Ok(to_deployment(&self.current(ctx, "get", id).await?))
    }

    async fn create_deployment(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("name", &request.name)?;
        validate_name("namespace", &request.namespace)?;
        let version = optional_str(&request.extensions, "version")?;
        let repo = optional_str(&request.extensions, "repo")?;
        let package_id = request.package_id.as_deref().filter(|p| !p.is_empty());

        let (source, version) = match (optional_str(&request.extensions, "chart")?, package_id) {
            (None, Some(package_id)) => {
                let (source, pinned) = self.chart_of(ctx, package_id).await?;
                (source.with_repo(repo), Some(version.map(str::to_string).unwrap_or(pinned)))
            }
            _ => {
                let source = ChartSource {
                    reference: required_str(&request.extensions, "chart")?.to_string(),
                    repo: repo.map(str::to_string),
                };
                (source, version.map(str::to_string))
            }
        };

        let install = InstallRequest {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            chart: source.reference.clone(),
            version,
            repo: source.repo.clone(),
            values: request.values.clone(),
            create_namespace: true,
        };
        let releases = self.releases.get(ctx).await?;
        let installed = releases
            .install(&install)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "install", &request.name, e))?;
        tracing::info!(
            adapter = %self.name,
            release = %installed.name,
            namespace = %installed.namespace,
            chart = %install.chart,
            "release installed"
        );
        self.remember(ctx, &installed, &source).await;
        Ok(to_deployment(&installed))
    }

    async fn update_deployment(
        &self,
        ctx: &OpContext,
        id: &str,
        update: &DeploymentUpdate,
    ) -> AdapterResult<Deployment> {
        ctx.check()?;
        let chart = optional_str(&update.extensions, "chart")?;
        let version = optional_str(&update.extensions, "version")?;
        let repo = optional_str(&update.extensions, "repo")?;
        let current = self.current(ctx, "update", id).await?;

        let (source, version) = match (chart, update.package_id.as_deref().filter(|p| !p.is_empty())) {
            (Some(chart), _) => (
                ChartSource {
                    reference: chart.to_string(),
                    repo: repo.map(str::to_string),
                },
                version.map(str::to_string),
            ),
            (None, Some(package_id)) => {
                let (source, pinned) = self.chart_of(ctx, package_id).await?;
                (source.with_repo(repo), Some(version.map(str::to_string).unwrap_or(pinned)))
            }
            // Same chart, pinned to the running version unless asked otherwise.
            (None, None) => {
                let source = self
                    .recorded_source(ctx, "update", &current.namespace, id)
                    .await?
                    .ok_or_else(|| unknown_source(id))?;
                (
                    source.with_repo(repo),
                    Some(version.map_or_else(|| current.chart_version.clone(), str::to_string)),
                )
            }
        };

        let request = UpgradeRequest {
            name: current.name,
            namespace: current.namespace,
            chart: source.reference.clone(),
            version,
            repo: source.repo.clone(),
            values: update.values.clone(),
            reuse_values: true,
        };
        self.upgrade(ctx, "update", request, &source).await
    }

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        let namespace = self.locate(ctx, "delete", id).await?;
        let releases = self.releases.get(ctx).await?;
        releases
            .uninstall(&namespace, id)
            .await
            .map_err(|e| release_error("delete", id, e))?;
        tracing::info!(adapter = %self.name, release = %id, %namespace, "release uninstalled");
        self.forget_source(ctx, &namespace, id).await;
        Ok(())
    }

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_replicas(replicas)?;
        let current = self.current(ctx, "scale", id).await?;
        let Some(source) = self.recorded_source(ctx, "scale", &current.namespace, id).await? else {
            return Err(AdapterError::unsupported(
                BACKEND,
                "scale",
                format!("chart reference of release {id} is unknown; update it with extensions.chart and extensions.repo first"),
            ));
        };
        let request = UpgradeRequest {
            name: current.name,
            namespace: current.namespace,
            chart: source.reference.clone(),
            version: Some(current.chart_version),
            repo: source.repo.clone(),
            values: [(REPLICA_VALUE.to_string(), json!(replicas))].into(),
            reuse_values: true,
        };
        self.upgrade(ctx, "scale", request, &source).await
    }

    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_revision(revision)?;
        let namespace = self.locate(ctx, "rollback", id).await?;
        let releases = self.releases.get(ctx).await?;
        let history = releases
            .history(&namespace, id)
            .await
            .map_err(|e| release_error("rollback", id, e))?;
        let target = history[history_index(id, revision, history.len())?].revision;

        releases
            .rollback(&namespace, id, target)
            .await
            .map_err(|e| release_error("rollback", id, e))?;
        tracing::info!(adapter = %self.name, release = %id, revision = target, "release rolled back");

        let current = releases
            .status(&namespace, id)
            .await
            .map_err(|e| release_error("rollback", id, e))?;
        match self.recorded_source(ctx, "rollback", &namespace, id).await {
            Ok(Some(source)) => self.remember(ctx, &current, &source).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(adapter = %self.name, release = %id, "could not refresh chart source: {e}"),
        }
        Ok(to_deployment(&current))
    }

    async fn deployment_status(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentStatusDetail> {
        ctx.check()?;
        let release = self.current(ctx, "status", id).await?;
        let verdict = evaluate(release.status);
        let updated_at = release.last_deployed.unwrap_or_else(Utc::now);
        let condition = DeploymentCondition {
            condition_type: "Released".into(),
            status: if verdict.status == DeploymentStatus::Deployed {
                "True".into()
            } else {
                "False".into()
            },
            reason: release.status.as_str().to_string(),
            message: release.description.clone(),
            last_transition_time: release.last_deployed,
        };
        Ok(DeploymentStatusDetail {
            id: id.to_string(),
            status: verdict.status,
            message: verdict.message,
            progress: verdict.progress,
            conditions: vec![condition],
            updated_at,
            extensions: release_extensions(&release),
        })
    }

    async fn deployment_history(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentHistory> {
        ctx.check()?;
        let namespace = self.locate(ctx, "history", id).await?;
        let releases = self.releases.get(ctx).await?;
        let history = releases
            .history(&namespace, id)
            .await
            .map_err(|e| release_error("history", id, e))?;
        let revisions = history
            .iter()
            .enumerate()
            .map(|(i, release)| DeploymentRevision {
                revision: i as i64,
                version: release.chart_version.clone(),
                deployed_at: release.last_deployed.unwrap_or_else(Utc::now),
                status: evaluate(release.status).status,
                description: release.description.clone(),
            })
            .collect();
        Ok(DeploymentHistory {
            deployment_id: id.to_string(),
            revisions,
        })
    }

    async fn deployment_logs(&self, ctx: &OpContext, id: &str, options: &LogOptions) -> AdapterResult<DeploymentLogs> {
        ctx.check()?;
        validate_log_options(options)?;
        let namespace = self.locate(ctx, "logs", id).await?;
        let selector = format!("{INSTANCE_LABEL}={id}");
        let cluster = self.cluster.get(ctx).await?;
        let logs = cluster
            .pod_logs(&namespace, &selector, options.container.as_deref(), options.tail_lines)
            .await
            .map_err(|e| deployment_error(BACKEND, "logs", id, e))?;
        Ok(log_entries(id, logs))
    }

    async fn health(&self, ctx: &OpContext) -> AdapterResult<()> {
        ctx.check()?;
        let releases = self.releases.get(ctx).await?;
        let version = releases
            .version()
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "health", "helm", e))?;
        tracing::debug!(adapter = %self.name, %version, "helm reachable");
        Ok(())
    }
}
