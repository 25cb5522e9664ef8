//! Flux through `Kustomization` and `HelmRelease` objects.
//!
//! Deployment ids carry the kind, `kustomization:<name>` or
//! `helmrelease:<name>`. A bare name is looked up as a Kustomization first.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::fmt;

use super::{
    AdapterKind, DeploymentAdapter, deployment_error, finish_packages, history_index, log_entries,
};
use crate::cluster::{ClusterError, ResourceClient, ResourceKind, tree};
use crate::error::{AdapterError, AdapterResult};
use crate::helm::ReleaseStatus;
use crate::models::{
    Capability, Deployment, DeploymentHistory, DeploymentLogs, DeploymentPackage, DeploymentRequest,
    DeploymentRevision, DeploymentStatusDetail, DeploymentUpdate, Extensions, Filter, LogOptions,
    PackageType, PackageUpload,
};
use crate::runtime::{LazyClient, OpContext, derive_package_id, finish_deployments, label_selector};
use crate::status;
use crate::validation::{
    optional_str, required_str, validate_log_options, validate_name, validate_path, validate_replicas,
    validate_revision,
};

const BACKEND: &str = "flux";

pub(crate) const REQUESTED_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";
const KUSTOMIZATION_NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Marks a GitRepository created alongside a Kustomization.
const OWNER_LABEL: &str = "wide-deploy.io/owned-by";

const CAPABILITIES: &[Capability] = &[
    Capability::DeploymentLifecycle,
    Capability::Rollback,
    Capability::Scaling,
    Capability::GitOps,
    Capability::HealthChecks,
];

const KUSTOMIZATION_FIELDS: &[(&str, &[&str])] = &[
    ("path", &["spec", "path"]),
    ("lastAppliedRevision", &["status", "lastAppliedRevision"]),
    ("lastAttemptedRevision", &["status", "lastAttemptedRevision"]),
];

const HELM_RELEASE_FIELDS: &[(&str, &[&str])] = &[
    ("chart", &["spec", "chart", "spec", "chart"]),
    ("chartVersion", &["spec", "chart", "spec", "version"]),
    ("releaseName", &["spec", "releaseName"]),
    ("lastAttemptedRevision", &["status", "lastAttemptedRevision"]),
];

pub fn kustomization_kind() -> ResourceKind {
    ResourceKind::namespaced("kustomize.toolkit.fluxcd.io", "v1", "Kustomization", "kustomizations")
}

pub fn helm_release_kind() -> ResourceKind {
    ResourceKind::namespaced("helm.toolkit.fluxcd.io", "v2", "HelmRelease", "helmreleases")
}

pub fn git_repository_kind() -> ResourceKind {
    ResourceKind::namespaced("source.toolkit.fluxcd.io", "v1", "GitRepository", "gitrepositories")
}

pub fn helm_repository_kind() -> ResourceKind {
    ResourceKind::namespaced("source.toolkit.fluxcd.io", "v1", "HelmRepository", "helmrepositories")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxKind {
    Kustomization,
    HelmRelease,
}

impl FluxKind {
    fn prefix(&self) -> &'static str {
        match self {
            FluxKind::Kustomization => "kustomization",
            FluxKind::HelmRelease => "helmrelease",
        }
    }

    fn resource(&self) -> ResourceKind {
        match self {
            FluxKind::Kustomization => kustomization_kind(),
            FluxKind::HelmRelease => helm_release_kind(),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kustomization" => Some(FluxKind::Kustomization),
            "helmrelease" => Some(FluxKind::HelmRelease),
            _ => None,
        }
    }
}

impl fmt::Display for FluxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FluxKind::Kustomization => "Kustomization",
            FluxKind::HelmRelease => "HelmRelease",
        })
    }
}

/// Splits `kind:name`; the kind is optional.
pub(crate) fn parse_id(id: &str) -> AdapterResult<(Option<FluxKind>, &str)> {
    let (kind, name) = match id.split_once(':') {
        Some((prefix, name)) => {
            let kind = FluxKind::parse(prefix).ok_or_else(|| {
                AdapterError::validation("id", format!("unknown kind prefix {prefix:?}, expected kustomization or helmrelease"))
            })?;
            (Some(kind), name)
        }
        None => (None, id),
    };
    validate_name("id", name)?;
    Ok((kind, name))
}

fn deployment_id(kind: FluxKind, name: &str) -> String {
    format!("{}:{name}", kind.prefix())
}

fn target_namespace(obj: &Value) -> String {
    tree::str_at(obj, &["spec", "targetNamespace"])
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| tree::namespace(obj))
}

/// Source reference as `(kind, namespace, name)`; the namespace defaults to the object's own.
fn source_ref(kind: FluxKind, obj: &Value) -> (String, String, String) {
    let reference = match kind {
        FluxKind::Kustomization => tree::lookup(obj, &["spec", "sourceRef"]),
        FluxKind::HelmRelease => tree::lookup(obj, &["spec", "chart", "spec", "sourceRef"]),
    };
    let field = |f: &str| reference.map(|r| tree::string_at(r, &[f])).unwrap_or_default();
    let namespace = Some(field("namespace"))
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| tree::namespace(obj));
    (field("kind"), namespace, field("name"))
}

fn verdict(obj: &Value) -> status::Verdict {
    status::flux::evaluate(
        &tree::conditions(obj),
        tree::bool_at(obj, &["spec", "suspend"]).unwrap_or(false),
        tree::is_deleting(obj),
    )
}

fn package_of(kind: FluxKind, obj: &Value) -> DeploymentPackage {
    let (source_kind, source_namespace, source_name) = source_ref(kind, obj);
    let source = format!("{source_kind}/{source_namespace}/{source_name}");
    let (package_type, locator, version) = match kind {
        FluxKind::Kustomization => (
            PackageType::GitRepository,
            tree::string_at(obj, &["spec", "path"]),
            tree::str_at(obj, &["status", "lastAppliedRevision"]).unwrap_or("latest").to_string(),
        ),
        FluxKind::HelmRelease => (
            PackageType::HelmChart,
            tree::string_at(obj, &["spec", "chart", "spec", "chart"]),
            tree::str_at(obj, &["spec", "chart", "spec", "version"]).unwrap_or("*").to_string(),
        ),
    };
    let mut extensions = Extensions::new();
    extensions.insert("sourceKind".into(), json!(source_kind));
    extensions.insert("sourceNamespace".into(), json!(source_namespace));
    extensions.insert("sourceName".into(), json!(source_name));
    extensions.insert(
        if kind == FluxKind::Kustomization { "path" } else { "chart" }.into(),
        json!(locator),
    );
    DeploymentPackage {
        id: derive_package_id(package_type, &source, &locator),
        name: match kind {
            FluxKind::Kustomization => source_name.clone(),
            FluxKind::HelmRelease => locator.clone(),
        },
        version,
        package_type,
        description: format!("{source_kind} {source_namespace}/{source_name}"),
        uploaded_at: tree::created_at(obj).unwrap_or_else(Utc::now),
        extensions,
    }
}

pub(crate) fn to_deployment(kind: FluxKind, obj: &Value) -> Deployment {
    let verdict = verdict(obj);
    let conditions = tree::conditions(obj);
    let created_at = tree::created_at(obj).unwrap_or_else(Utc::now);
    let (source_kind, _, source_name) = source_ref(kind, obj);

    let mut extensions = Extensions::new();
    extensions.insert("kind".into(), json!(kind.to_string()));
    extensions.insert("sourceKind".into(), json!(source_kind));
    extensions.insert("sourceName".into(), json!(source_name));
    extensions.insert(
        "suspended".into(),
        json!(tree::bool_at(obj, &["spec", "suspend"]).unwrap_or(false)),
    );
    let fields = match kind {
        FluxKind::Kustomization => KUSTOMIZATION_FIELDS,
        FluxKind::HelmRelease => HELM_RELEASE_FIELDS,
    };
    for (key, path) in fields {
        if let Some(value) = tree::str_at(obj, path) {
            extensions.insert(key.to_string(), json!(value));
        }
    }

    let version = match kind {
        FluxKind::HelmRelease => tree::i64_at(obj, &["status", "history", "0", "version"]),
        FluxKind::Kustomization => tree::i64_at(obj, &["status", "observedGeneration"]),
    }
    .or_else(|| tree::i64_at(obj, &["metadata", "generation"]))
    .unwrap_or_default();

    Deployment {
        id: deployment_id(kind, &tree::name(obj)),
        name: tree::name(obj),
        package_id: package_of(kind, obj).id,
        namespace: target_namespace(obj),
        status: verdict.status,
        version,
        description: verdict.message,
        created_at,
        updated_at: tree::last_transition(&conditions).unwrap_or(created_at),
        labels: tree::labels(obj),
        extensions,
    }
}

/// Oldest-first history. HelmRelease keeps release snapshots newest first;
/// a Kustomization only remembers its last applied revision.
pub(crate) fn to_history(kind: FluxKind, obj: &Value) -> DeploymentHistory {
    let id = deployment_id(kind, &tree::name(obj));
    let revisions = match kind {
        FluxKind::HelmRelease => tree::array_at(obj, &["status", "history"])
            .iter()
            .rev()
            .enumerate()
            .map(|(index, snapshot)| {
                let native = ReleaseStatus::parse(tree::str_at(snapshot, &["status"]).unwrap_or_default());
                let chart = tree::string_at(snapshot, &["chartName"]);
                let chart_version = tree::string_at(snapshot, &["chartVersion"]);
                DeploymentRevision {
                    revision: index as i64,
                    description: format!(
                        "{chart} {chart_version} as release revision {}",
                        tree::i64_at(snapshot, &["version"]).unwrap_or_default()
                    ),
                    version: chart_version,
                    deployed_at: tree::time_at(snapshot, &["lastDeployed"])
                        .or_else(|| tree::time_at(snapshot, &["firstDeployed"]))
                        .unwrap_or_else(Utc::now),
                    status: status::helm::evaluate(native).status,
                }
            })
            .collect(),
        FluxKind::Kustomization => match tree::str_at(obj, &["status", "lastAppliedRevision"]) {
            Some(applied) if !applied.is_empty() => {
                let conditions = tree::conditions(obj);
                vec![DeploymentRevision {
                    revision: 0,
                    version: applied.to_string(),
                    deployed_at: tree::find_condition(&conditions, "Ready")
                        .and_then(|c| c.last_transition_time)
                        .or_else(|| tree::created_at(obj))
                        .unwrap_or_else(Utc::now),
                    status: verdict(obj).status,
                    description: "last applied revision".to_string(),
                }]
            }
            _ => Vec::new(),
        },
    };
    DeploymentHistory {
        deployment_id: id,
        revisions,
    }
}

/// Commit sha of a Flux revision string: `main@sha1:<sha>` or the older `main/<sha>`.
pub(crate) fn commit_of(revision: &str) -> Option<&str> {
    let sha = match revision.rsplit_once(':') {
        Some((_, sha)) => sha,
        None => revision.rsplit_once('/').map(|(_, sha)| sha).unwrap_or(revision),
    };
    (!sha.is_empty() && sha.chars().all(|c| c.is_ascii_hexdigit())).then_some(sha)
}

fn request_reconcile(obj: &mut Value) {
    tree::set_at(
        obj,
        &["metadata", "annotations", REQUESTED_AT_ANNOTATION],
        json!(Utc::now().to_rfc3339()),
    );
}

/// Kustomizations take string substitutions only.
fn substitutions(values: &std::collections::BTreeMap<String, Value>) -> AdapterResult<Value> {
    let mut substitute = serde_json::Map::new();
    for (key, value) in values {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(AdapterError::validation(
                    format!("values.{key}"),
                    format!("kustomizations accept scalar substitutions only, got {other}"),
                ));
            }
        };
        substitute.insert(key.clone(), json!(text));
    }
    Ok(Value::Object(substitute))
}

pub struct FluxAdapter {
    name: String,
    namespace: String,
    client: LazyClient<dyn ResourceClient>,
}

impl FluxAdapter {
    /// `namespace` holds the Flux objects, usually `flux-system`.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, client: LazyClient<dyn ResourceClient>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            client,
        }
    }

    async fn resolve(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<(FluxKind, Value)> {
        let (kind, name) = parse_id(id)?;
        let client = self.client.get(ctx).await?;
        let candidates = match kind {
            Some(kind) => vec![kind],
            None => vec![FluxKind::Kustomization, FluxKind::HelmRelease],
        };
        for kind in candidates {
            match client.get(&kind.resource(), &self.namespace, name).await {
                Ok(obj) => return Ok((kind, obj)),
                Err(ClusterError::NotFound { .. }) => continue,
                Err(e) => return Err(AdapterError::backend(BACKEND, operation, id, e)),
            }
        }
        Err(AdapterError::DeploymentNotFound(id.to_string()))
    }

    /// Puts back the `spec.ref` a rollback replaced on a GitRepository.
    async fn restore_source_ref(
        &self,
        ctx: &OpContext,
        namespace: &str,
        name: &str,
        previous_ref: Option<Value>,
    ) -> AdapterResult<()> {
        let client = self.client.get(ctx).await?;
        let mut source = client
            .get(&git_repository_kind(), namespace, name)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "restore source", name, e))?;
        match previous_ref {
            Some(previous) => tree::set_at(&mut source, &["spec", "ref"], previous),
            None => {
                tree::remove_at(&mut source, &["spec", "ref"]);
            }
        }
        request_reconcile(&mut source);
        client
            .update(&git_repository_kind(), namespace, source)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "restore source", name, e))?;
        Ok(())
    }

    async fn write(&self, ctx: &OpContext, operation: &'static str, kind: FluxKind, obj: Value) -> AdapterResult<Deployment> {
        let id = deployment_id(kind, &tree::name(&obj));
        let client = self.client.get(ctx).await?;
        let updated = client
            .update(&kind.resource(), &self.namespace, obj)
            .await
            .map_err(|e| deployment_error(BACKEND, operation, &id, e))?;
        Ok(to_deployment(kind, &updated))
    }

    async fn objects(&self, ctx: &OpContext, kind: FluxKind, selector: Option<&str>) -> AdapterResult<Vec<Value>> {
        let client = self.client.get(ctx).await?;
        client
            .list(&kind.resource(), Some(&self.namespace), selector)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", kind.prefix(), e))
    }

    async fn all_objects(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<(FluxKind, Value)>> {
        let only = match filter.extensions.get("kind").and_then(Value::as_str) {
            Some(kind) => Some(FluxKind::parse(kind).ok_or_else(|| {
                AdapterError::validation("extensions.kind", format!("unknown kind {kind:?}"))
            })?),
            None => None,
        };
        let selector = label_selector(&filter.labels);
        let mut all = Vec::new();
        for kind in [FluxKind::Kustomization, FluxKind::HelmRelease] {
            if only.is_some_and(|only| only != kind) {
                continue;
            }
            all.extend(
                self.objects(ctx, kind, selector.as_deref())
                    .await?
                    .into_iter()
                    .map(|obj| (kind, obj)),
            );
        }
        Ok(all)
    }

    fn kustomization(&self, request: &DeploymentRequest, source_name: &str) -> AdapterResult<Value> {
        let ext = &request.extensions;
        let path = optional_str(ext, "path")?.unwrap_or("./");
        validate_path("extensions.path", path)?;
        let mut obj = json!({
            "apiVersion": kustomization_kind().api_version(),
            "kind": "Kustomization",
            "metadata": {
                "name": request.name,
                "namespace": self.namespace,
                "labels": request.labels,
            },
            "spec": {
                "interval": optional_str(ext, "interval")?.unwrap_or("5m"),
                "path": path,
                "prune": true,
                "targetNamespace": request.namespace,
                "sourceRef": { "kind": "GitRepository", "name": source_name },
            },
        });
        if !request.values.is_empty() {
            tree::set_at(&mut obj, &["spec", "postBuild", "substitute"], substitutions(&request.values)?);
        }
        Ok(obj)
    }

    fn git_repository(&self, request: &DeploymentRequest, url: &str) -> AdapterResult<Value> {
        let branch = optional_str(&request.extensions, "branch")?.unwrap_or("main");
        Ok(json!({
            "apiVersion": git_repository_kind().api_version(),
            "kind": "GitRepository",
            "metadata": {
                "name": request.name,
                "namespace": self.namespace,
                "labels": { OWNER_LABEL: request.name },
            },
            "spec": {
                "url": url,
                "interval": "1m",
                "ref": { "branch": branch },
            },
        }))
    }

    fn helm_release(&self, request: &DeploymentRequest) -> AdapterResult<Value> {
        let ext = &request.extensions;
        let chart = required_str(ext, "chart")?;
        let source_name = required_str(ext, "sourceName")?;
        validate_name("extensions.sourceName", source_name)?;
        let source_kind = optional_str(ext, "sourceKind")?.unwrap_or("HelmRepository");
        let mut chart_spec = json!({
            "chart": chart,
            "sourceRef": { "kind": source_kind, "name": source_name, "namespace": self.namespace },
        });
        if let Some(version) = optional_str(ext, "version")? {
            tree::set_at(&mut chart_spec, &["version"], json!(version));
        }
        Ok(json!({
            "apiVersion": helm_release_kind().api_version(),
            "kind": "HelmRelease",
            "metadata": {
                "name": request.name,
                "namespace": self.namespace,
                "labels": request.labels,
            },
            "spec": {
                "interval": optional_str(ext, "interval")?.unwrap_or("5m"),
                "releaseName": request.name,
                "targetNamespace": request.namespace,
                "install": { "createNamespace": true },
                "chart": { "spec": chart_spec },
                "values": request.values,
            },
        }))
    }

    async fn create_kustomization(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment> {
        let ext = &request.extensions;
        let source_name = optional_str(ext, "sourceName")?;
        let repo_url = optional_str(ext, "repoURL")?;
        let (source_name, repository) = match (source_name, repo_url) {
            (Some(name), _) => {
                validate_name("extensions.sourceName", name)?;
                (name.to_string(), None)
            }
            (None, Some(url)) => (request.name.clone(), Some(self.git_repository(request, url)?)),
            (None, None) => {
                return Err(AdapterError::validation(
                    "extensions.sourceName",
                    "either sourceName or repoURL is required",
                ));
            }
        };
        let kustomization = self.kustomization(request, &source_name)?;

        let client = self.client.get(ctx).await?;
        if let Some(repository) = repository {
            client
                .create(&git_repository_kind(), &self.namespace, repository)
                .await
                .map_err(|e| AdapterError::backend(BACKEND, "create source", &request.name, e))?;
        }
        match client.create(&kustomization_kind(), &self.namespace, kustomization).await {
            Ok(created) => Ok(to_deployment(FluxKind::Kustomization, &created)),
            Err(e) => {
                if repo_url.is_some() && source_name == request.name {
                    tracing::warn!(adapter = %self.name, source = %source_name, "kustomization create failed, removing its source");
                    if let Err(cleanup) = client.delete(&git_repository_kind(), &self.namespace, &source_name).await {
                        tracing::warn!(adapter = %self.name, source = %source_name, "source cleanup failed: {cleanup}");
                    }
                }
                Err(AdapterError::backend(BACKEND, "create", &request.name, e))
            }
        }
    }
}

#[async_trait]
impl DeploymentAdapter for FluxAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Flux
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn list_packages(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<DeploymentPackage>> {
        ctx.check()?;
        let objects = self.all_objects(ctx, &Filter::default()).await?;
        let mut packages: Vec<DeploymentPackage> =
            objects.iter().map(|(kind, obj)| package_of(*kind, obj)).collect();

        let mut urls = std::collections::BTreeMap::new();
        let client = self.client.get(ctx).await?;
        for kind in [git_repository_kind(), helm_repository_kind()] {
            let sources = client
                .list(&kind, Some(&self.namespace), None)
                .await
                .map_err(|e| AdapterError::backend(BACKEND, "list", kind.plural.clone(), e))?;
            for source in sources {
                let url = tree::string_at(&source, &["spec", "url"]);
                urls.insert((kind.kind.clone(), tree::namespace(&source), tree::name(&source)), url);
            }
        }
        for package in &mut packages {
            let part = |key: &str| {
                package
                    .extensions
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let key = (part("sourceKind"), part("sourceNamespace"), part("sourceName"));
            if let Some(url) = urls.get(&key) {
                package.extensions.insert("url".into(), json!(url));
            }
        }
        Ok(finish_packages(packages, filter))
    }

    async fn get_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        self.list_packages(ctx, &Filter::default())
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| AdapterError::PackageNotFound(id.to_string()))
    }

    async fn upload_package(&self, ctx: &OpContext, _upload: &PackageUpload) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        Err(AdapterError::unsupported(
            BACKEND,
            "upload package",
            "sources are created with their deployment; pass extensions.repoURL when creating a kustomization",
        ))
    }

    async fn delete_package(&self, ctx: &OpContext, _id: &str) -> AdapterResult<()> {
        ctx.check()?;
        Err(AdapterError::unsupported(
            BACKEND,
            "delete package",
            "packages are derived from live deployments; delete the deployments that reference it",
        ))
    }

    async fn list_deployments(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<Deployment>> {
        ctx.check()?;
        let objects = self.all_objects(ctx, filter).await?;
        let items = objects
            .iter()
            .map(|(kind, obj)| to_deployment(*kind, obj))
            .collect();
        Ok(finish_deployments(items, filter, true))
    }

    async fn get_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<Deployment> {
        ctx.check()?;
        let (kind, obj) = self.resolve(ctx, "get", id).await?;
        Ok(to_deployment(kind, &obj))
    }

    async fn create_deployment(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("name", &request.name)?;
        validate_name("namespace", &request.namespace)?;
        let kind = match optional_str(&request.extensions, "kind")? {
            None => FluxKind::Kustomization,
            Some(kind) => FluxKind::parse(kind).ok_or_else(|| {
                AdapterError::validation("extensions.kind", format!("{kind:?} is neither Kustomization nor HelmRelease"))
            })?,
        };
        let created = match kind {
            FluxKind::Kustomization => self.create_kustomization(ctx, request).await?,
            FluxKind::HelmRelease => {
                let release = self.helm_release(request)?;
                let client = self.client.get(ctx).await?;
                let created = client
                    .create(&helm_release_kind(), &self.namespace, release)
                    .await
                    .map_err(|e| AdapterError::backend(BACKEND, "create", &request.name, e))?;
                to_deployment(FluxKind::HelmRelease, &created)
            }
        };
        tracing::info!(adapter = %self.name, deployment = %created.id, "flux deployment created");
        Ok(created)
    }

    async fn update_deployment(
        &self,
        ctx: &OpContext,
        id: &str,
        update: &DeploymentUpdate,
    ) -> AdapterResult<Deployment> {
        ctx.check()?;
        parse_id(id)?;
        let path = optional_str(&update.extensions, "path")?;
        if let Some(path) = path {
            validate_path("extensions.path", path)?;
        }
        let version = optional_str(&update.extensions, "version")?;

        let (kind, mut obj) = self.resolve(ctx, "update", id).await?;
        match kind {
            FluxKind::HelmRelease => {
                for (key, value) in &update.values {
                    tree::set_at(&mut obj, &["spec", "values", key.as_str()], value.clone());
                }
                if let Some(version) = version {
                    tree::set_at(&mut obj, &["spec", "chart", "spec", "version"], json!(version));
                }
            }
            FluxKind::Kustomization => {
                if let Value::Object(substitute) = substitutions(&update.values)? {
                    for (key, value) in substitute {
                        tree::set_at(&mut obj, &["spec", "postBuild", "substitute", key.as_str()], value);
                    }
                }
                if let Some(path) = path {
                    tree::set_at(&mut obj, &["spec", "path"], json!(path));
                }
            }
        }
        for (key, value) in &update.labels {
            tree::set_at(&mut obj, &["metadata", "labels", key.as_str()], json!(value));
        }
        request_reconcile(&mut obj);
        let deployment = self.write(ctx, "update", kind, obj).await?;
        tracing::info!(adapter = %self.name, deployment = %deployment.id, "flux deployment updated");
        Ok(deployment)
    }

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        let (kind, obj) = self.resolve(ctx, "delete", id).await?;
        let name = tree::name(&obj);
        let client = self.client.get(ctx).await?;
        client
            .delete(&kind.resource(), &self.namespace, &name)
            .await
            .map_err(|e| deployment_error(BACKEND, "delete", id, e))?;

        if kind == FluxKind::Kustomization {
            let (source_kind, source_namespace, source_name) = source_ref(kind, &obj);
            if source_kind == "GitRepository" {
                let owned = client
                    .get(&git_repository_kind(), &source_namespace, &source_name)
                    .await
                    .ok()
                    .is_some_and(|source| tree::labels(&source).get(OWNER_LABEL) == Some(&name));
                if owned {
                    if let Err(e) = client.delete(&git_repository_kind(), &source_namespace, &source_name).await {
                        tracing::warn!(adapter = %self.name, source = %source_name, "could not remove owned source: {e}");
                    }
                }
            }
        }
        tracing::info!(adapter = %self.name, deployment = %id, "flux deployment deleted");
        Ok(())
    }

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment> {
        ctx.check()?;
        let (kind, _) = parse_id(id)?;
        validate_replicas(replicas)?;
        if kind == Some(FluxKind::Kustomization) {
            return Err(kustomization_scale_unsupported());
        }
        let (kind, mut obj) = self.resolve(ctx, "scale", id).await?;
        if kind == FluxKind::Kustomization {
            return Err(kustomization_scale_unsupported());
        }
        tree::set_at(&mut obj, &["spec", "values", "replicaCount"], json!(replicas));
        request_reconcile(&mut obj);
        let deployment = self.write(ctx, "scale", kind, obj).await?;
        tracing::info!(adapter = %self.name, deployment = %deployment.id, replicas, "helm release scaled");
        Ok(deployment)
    }

    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment> {
        ctx.check()?;
        parse_id(id)?;
        validate_revision(revision)?;
        let (kind, mut obj) = self.resolve(ctx, "rollback", id).await?;
        let history = to_history(kind, &obj);
        let entry = &history.revisions[history_index(id, revision, history.revisions.len())?];

        let mut pinned = None;
        match kind {
            FluxKind::HelmRelease => {
                tree::set_at(&mut obj, &["spec", "chart", "spec", "version"], json!(entry.version));
            }
            FluxKind::Kustomization => {
                let commit = commit_of(&entry.version).ok_or_else(|| {
                    AdapterError::malformed(BACKEND, "rollback", id, format!("no commit in revision {:?}", entry.version))
                })?;
                let (source_kind, source_namespace, source_name) = source_ref(kind, &obj);
                if source_kind != "GitRepository" {
                    return Err(AdapterError::unsupported(
                        BACKEND,
                        "rollback",
                        format!("{source_kind} sources cannot be pinned to a commit; change the source revision instead"),
                    ));
                }
                let client = self.client.get(ctx).await?;
                let mut source = client
                    .get(&git_repository_kind(), &source_namespace, &source_name)
                    .await
                    .map_err(|e| AdapterError::backend(BACKEND, "rollback", &source_name, e))?;
                let previous_ref = tree::lookup(&source, &["spec", "ref"]).cloned();
                tree::set_at(&mut source, &["spec", "ref", "commit"], json!(commit));
                request_reconcile(&mut source);
                client
                    .update(&git_repository_kind(), &source_namespace, source)
                    .await
                    .map_err(|e| AdapterError::backend(BACKEND, "rollback", &source_name, e))?;
                pinned = Some((source_namespace, source_name, previous_ref));
            }
        }
        request_reconcile(&mut obj);
        match self.write(ctx, "rollback", kind, obj).await {
            Ok(deployment) => {
                tracing::info!(adapter = %self.name, deployment = %deployment.id, revision, "rollback requested");
                Ok(deployment)
            }
            Err(e) => {
                if let Some((namespace, name, previous_ref)) = pinned {
                    tracing::warn!(adapter = %self.name, source = %name, "rollback write failed, restoring source ref");
                    if let Err(restore) = self.restore_source_ref(ctx, &namespace, &name, previous_ref).await {
                        tracing::warn!(adapter = %self.name, source = %name, "source ref restore failed: {restore}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn deployment_status(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentStatusDetail> {
        ctx.check()?;
        let (kind, obj) = self.resolve(ctx, "status", id).await?;
        let verdict = verdict(&obj);
        let conditions = tree::conditions(&obj);
        let mut extensions = Extensions::new();
        extensions.insert("kind".into(), json!(kind.to_string()));
        if let Some(revision) = tree::str_at(&obj, &["status", "lastAttemptedRevision"]) {
            extensions.insert("lastAttemptedRevision".into(), json!(revision));
        }
        Ok(DeploymentStatusDetail {
            id: deployment_id(kind, &tree::name(&obj)),
            status: verdict.status,
            message: verdict.message,
            progress: verdict.progress,
            updated_at: tree::last_transition(&conditions).unwrap_or_else(Utc::now),
            conditions,
            extensions,
        })
    }

    async fn deployment_history(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentHistory> {
        ctx.check()?;
        let (kind, obj) = self.resolve(ctx, "history", id).await?;
        Ok(to_history(kind, &obj))
    }

    async fn deployment_logs(&self, ctx: &OpContext, id: &str, options: &LogOptions) -> AdapterResult<DeploymentLogs> {
        ctx.check()?;
        parse_id(id)?;
        validate_log_options(options)?;
        let (kind, obj) = self.resolve(ctx, "logs", id).await?;
        let name = tree::name(&obj);
        let selector = match kind {
            FluxKind::Kustomization => format!("{KUSTOMIZATION_NAME_LABEL}={name}"),
            FluxKind::HelmRelease => {
                let release = tree::str_at(&obj, &["spec", "releaseName"])
                    .filter(|r| !r.is_empty())
                    .unwrap_or(&name);
                format!("{INSTANCE_LABEL}={release}")
            }
        };
        let client = self.client.get(ctx).await?;
        let logs = client
            .pod_logs(&target_namespace(&obj), &selector, options.container.as_deref(), options.tail_lines)
            .await
            .map_err(|e| deployment_error(BACKEND, "logs", id, e))?;
        Ok(log_entries(&deployment_id(kind, &name), logs))
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

fn kustomization_scale_unsupported() -> AdapterError {
    AdapterError::unsupported(
        BACKEND,
        "scale",
        "kustomizations apply plain manifests; change replicas in Git or deploy as a HelmRelease",
    )
}
