//! The canonical operation contract and its per-backend translators.

pub mod argocd;
pub mod argocd_rest;
pub mod crossplane;
pub mod flux;
pub mod helm;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cluster::{ClusterError, PodLog};
use crate::error::{AdapterError, AdapterResult};
use crate::models::{
    Capability, Deployment, DeploymentHistory, DeploymentLogs, DeploymentPackage, DeploymentRequest,
    DeploymentStatusDetail, DeploymentUpdate, Filter, LogEntry, LogOptions, PackageUpload,
};
use crate::runtime::OpContext;

pub use argocd::ArgocdAdapter;
pub use argocd_rest::ArgocdRestAdapter;
pub use crossplane::CrossplaneAdapter;
pub use flux::FluxAdapter;
pub use helm::HelmAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    Argocd,
    ArgocdRest,
    Crossplane,
    Flux,
    Helm,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Argocd => "argocd",
            AdapterKind::ArgocdRest => "argocd-rest",
            AdapterKind::Crossplane => "crossplane",
            AdapterKind::Flux => "flux",
            AdapterKind::Helm => "helm",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend behind the canonical operation set.
///
/// Every operation checks `ctx` for cancellation and validates its input
/// before touching the backend. Operations a backend cannot express fail
/// with [`AdapterError::Unsupported`]; none of them is a silent no-op.
#[async_trait]
pub trait DeploymentAdapter: Send + Sync {
    /// Instance name from configuration.
    fn name(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    fn capabilities(&self) -> &'static [Capability];

    async fn list_packages(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<DeploymentPackage>>;

    async fn get_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentPackage>;

    async fn upload_package(&self, ctx: &OpContext, upload: &PackageUpload) -> AdapterResult<DeploymentPackage>;

    async fn delete_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<()>;

    async fn list_deployments(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<Deployment>>;

    async fn get_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<Deployment>;

    async fn create_deployment(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment>;

    async fn update_deployment(
        &self,
        ctx: &OpContext,
        id: &str,
        update: &DeploymentUpdate,
    ) -> AdapterResult<Deployment>;

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()>;

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment>;

    /// `revision` indexes [`DeploymentHistory::revisions`], oldest first.
    /// Returns once the desired state has been written; reconciliation
    /// happens asynchronously in the backend.
    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment>;

    async fn deployment_status(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentStatusDetail>;

    async fn deployment_history(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentHistory>;

    async fn deployment_logs(&self, ctx: &OpContext, id: &str, options: &LogOptions) -> AdapterResult<DeploymentLogs>;

    async fn health(&self, ctx: &OpContext) -> AdapterResult<()>;
}

/// Configured adapters by instance name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn DeploymentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any adapter registered under the same name.
    pub fn register(&mut self, adapter: Arc<dyn DeploymentAdapter>) {
        let name = adapter.name().to_string();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            tracing::warn!(adapter = %name, "adapter registered twice, keeping the last one");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeploymentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeploymentAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Maps a cluster failure on a deployment resource.
pub(crate) fn deployment_error(
    backend: &'static str,
    operation: &'static str,
    id: &str,
    err: ClusterError,
) -> AdapterError {
    match err {
        ClusterError::NotFound { .. } => AdapterError::DeploymentNotFound(id.to_string()),
        other => AdapterError::backend(backend, operation, id, other),
    }
}

/// Maps a cluster failure on a package resource.
pub(crate) fn package_error(
    backend: &'static str,
    operation: &'static str,
    id: &str,
    err: ClusterError,
) -> AdapterError {
    match err {
        ClusterError::NotFound { .. } => AdapterError::PackageNotFound(id.to_string()),
        other => AdapterError::backend(backend, operation, id, other),
    }
}

pub(crate) fn log_entries(deployment_id: &str, logs: Vec<PodLog>) -> DeploymentLogs {
    DeploymentLogs {
        deployment_id: deployment_id.to_string(),
        entries: logs
            .into_iter()
            .map(|log| LogEntry {
                pod: log.pod,
                container: log.container,
                lines: log.text.lines().map(str::to_string).collect(),
            })
            .collect(),
    }
}

/// Bounds-checks a history index.
pub(crate) fn history_index(id: &str, revision: i64, available: usize) -> AdapterResult<usize> {
    usize::try_from(revision)
        .ok()
        .filter(|i| *i < available)
        .ok_or_else(|| AdapterError::RevisionNotFound {
            id: id.to_string(),
            revision,
            available,
        })
}

/// Deduplicates packages by id and cuts the requested page.
pub(crate) fn finish_packages(mut items: Vec<DeploymentPackage>, filter: &Filter) -> Vec<DeploymentPackage> {
    items.sort_by(|a, b| a.id.cmp(&b.id));
    items.dedup_by(|a, b| a.id == b.id);
    crate::runtime::paginate(items, filter.limit, filter.offset)
}
