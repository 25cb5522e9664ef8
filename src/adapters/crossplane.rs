//! Crossplane through composite resources and `Configuration` packages.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::{AdapterKind, DeploymentAdapter, deployment_error, finish_packages, package_error};
use crate::cluster::{ResourceClient, ResourceKind, tree};
use crate::error::{AdapterError, AdapterResult};
use crate::models::{
    Capability, Deployment, DeploymentHistory, DeploymentLogs, DeploymentPackage, DeploymentRequest,
    DeploymentRevision, DeploymentStatusDetail, DeploymentUpdate, Extensions, Filter, LogOptions,
    PackageType, PackageUpload,
};
use crate::runtime::{LazyClient, OpContext, derive_package_id, finish_deployments, label_selector};
use crate::status::crossplane::evaluate;
use crate::validation::{
    optional_str, required_str, validate_log_options, validate_name, validate_replicas, validate_revision,
};

const BACKEND: &str = "crossplane";

/// Package id the deployment was created from.
const PACKAGE_ANNOTATION: &str = "wide-deploy.io/package-id";

const CAPABILITIES: &[Capability] = &[
    Capability::PackageManagement,
    Capability::DeploymentLifecycle,
    Capability::HealthChecks,
];

pub fn configuration_kind() -> ResourceKind {
    ResourceKind::cluster_scoped("pkg.crossplane.io", "v1", "Configuration", "configurations")
}

/// Tag of an OCI reference, ignoring registry ports.
pub(crate) fn package_tag(reference: &str) -> Option<&str> {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}

fn configuration_to_package(config: &Value) -> DeploymentPackage {
    let reference = tree::string_at(config, &["spec", "package"]);
    let verdict = evaluate(&tree::conditions(config), tree::is_deleting(config));
    let mut extensions = Extensions::new();
    extensions.insert("package".into(), json!(reference));
    extensions.insert("status".into(), json!(verdict.status));
    if let Some(revision) = tree::str_at(config, &["status", "currentRevision"]) {
        extensions.insert("currentRevision".into(), json!(revision));
    }
    DeploymentPackage {
        id: derive_package_id(PackageType::CrossplanePackage, &reference, ""),
        name: tree::name(config),
        version: package_tag(&reference).unwrap_or("latest").to_string(),
        package_type: PackageType::CrossplanePackage,
        description: verdict.message,
        uploaded_at: tree::created_at(config).unwrap_or_else(Utc::now),
        extensions,
    }
}

fn composite_to_deployment(composite: &Value) -> Deployment {
    let conditions = tree::conditions(composite);
    let verdict = evaluate(&conditions, tree::is_deleting(composite));
    let created_at = tree::created_at(composite).unwrap_or_else(Utc::now);

    let mut extensions = Extensions::new();
    if let Some(kind) = tree::str_at(composite, &["kind"]) {
        extensions.insert("kind".into(), json!(kind));
    }
    if let Some(composition) = tree::str_at(composite, &["spec", "compositionRef", "name"]) {
        extensions.insert("composition".into(), json!(composition));
    }
    if let Some(revision) = tree::str_at(composite, &["spec", "compositionRevisionRef", "name"]) {
        extensions.insert("compositionRevision".into(), json!(revision));
    }
    extensions.insert(
        "resourceCount".into(),
        json!(tree::array_at(composite, &["spec", "resourceRefs"]).len()),
    );

    Deployment {
        id: tree::name(composite),
        name: tree::name(composite),
        package_id: tree::string_at(composite, &["metadata", "annotations", PACKAGE_ANNOTATION]),
        namespace: tree::string_at(composite, &["spec", "parameters", "namespace"]),
        status: verdict.status,
        version: tree::i64_at(composite, &["metadata", "generation"]).unwrap_or(1),
        description: verdict.message,
        created_at,
        updated_at: tree::last_transition(&conditions).unwrap_or(created_at),
        labels: tree::labels(composite),
        extensions,
    }
}

pub struct CrossplaneAdapter {
    name: String,
    composite: ResourceKind,
    client: LazyClient<dyn ResourceClient>,
}

impl CrossplaneAdapter {
    /// `composite` is the cluster-scoped composite resource type deployments are made of.
    pub fn new(name: impl Into<String>, composite: ResourceKind, client: LazyClient<dyn ResourceClient>) -> Self {
        Self {
            name: name.into(),
            composite,
            client,
        }
    }

    async fn composite(&self, ctx: &OpContext, operation: &'static str, id: &str) -> AdapterResult<Value> {
        validate_name("id", id)?;
        let client = self.client.get(ctx).await?;
        client
            .get(&self.composite, "", id)
            .await
            .map_err(|e| deployment_error(BACKEND, operation, id, e))
    }

    async fn configurations(&self, ctx: &OpContext) -> AdapterResult<Vec<Value>> {
        let client = self.client.get(ctx).await?;
        client
            .list(&configuration_kind(), None, None)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", "configurations", e))
    }

    async fn configuration_by_id(&self, ctx: &OpContext, id: &str) -> AdapterResult<Value> {
        self.configurations(ctx)
            .await?
            .into_iter()
            .find(|config| configuration_to_package(config).id == id)
            .ok_or_else(|| AdapterError::PackageNotFound(id.to_string()))
    }
}

#[async_trait]
impl DeploymentAdapter for CrossplaneAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Crossplane
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn list_packages(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<DeploymentPackage>> {
        ctx.check()?;
        let configs = self.configurations(ctx).await?;
        Ok(finish_packages(configs.iter().map(configuration_to_package).collect(), filter))
    }

    async fn get_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        Ok(configuration_to_package(&self.configuration_by_id(ctx, id).await?))
    }

    async fn upload_package(&self, ctx: &OpContext, upload: &PackageUpload) -> AdapterResult<DeploymentPackage> {
        ctx.check()?;
        validate_name("name", &upload.name)?;
        let reference = upload.reference.trim();
        if reference.is_empty() {
            return Err(AdapterError::validation("reference", "is required"));
        }
        let reference = match (&upload.version, package_tag(reference)) {
            (Some(version), None) => format!("{reference}:{version}"),
            (Some(version), Some(tag)) if version != tag => {
                return Err(AdapterError::validation(
                    "version",
                    format!("{version:?} disagrees with the tag {tag:?} in the reference"),
                ));
            }
            _ => reference.to_string(),
        };
        let pull_policy = optional_str(&upload.extensions, "packagePullPolicy")?.unwrap_or("IfNotPresent");
        let config = json!({
            "apiVersion": configuration_kind().api_version(),
            "kind": "Configuration",
            "metadata": { "name": upload.name },
            "spec": {
                "package": reference,
                "packagePullPolicy": pull_policy,
                "revisionActivationPolicy": "Automatic",
            },
        });
        let client = self.client.get(ctx).await?;
        let created = client
            .create(&configuration_kind(), "", config)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "upload package", &upload.name, e))?;
        tracing::info!(adapter = %self.name, package = %reference, "configuration package installed");
        Ok(configuration_to_package(&created))
    }

    async fn delete_package(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        let config = self.configuration_by_id(ctx, id).await?;
        let name = tree::name(&config);
        let client = self.client.get(ctx).await?;
        client
            .delete(&configuration_kind(), "", &name)
            .await
            .map_err(|e| package_error(BACKEND, "delete package", id, e))?;
        tracing::info!(adapter = %self.name, package = %name, "configuration package removed");
        Ok(())
    }

    async fn list_deployments(&self, ctx: &OpContext, filter: &Filter) -> AdapterResult<Vec<Deployment>> {
        ctx.check()?;
        let selector = label_selector(&filter.labels);
        let client = self.client.get(ctx).await?;
        let composites = client
            .list(&self.composite, None, selector.as_deref())
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "list", self.composite.plural.clone(), e))?;
        Ok(finish_deployments(
            composites.iter().map(composite_to_deployment).collect(),
            filter,
            true,
        ))
    }

    async fn get_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<Deployment> {
        ctx.check()?;
        Ok(composite_to_deployment(&self.composite(ctx, "get", id).await?))
    }

    async fn create_deployment(&self, ctx: &OpContext, request: &DeploymentRequest) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("name", &request.name)?;
        validate_name("namespace", &request.namespace)?;
        let composition = required_str(&request.extensions, "composition")?;
        validate_name("extensions.composition", composition)?;

        let mut parameters = serde_json::Map::new();
        for (key, value) in &request.values {
            parameters.insert(key.clone(), value.clone());
        }
        parameters.insert("namespace".into(), json!(request.namespace));

        let mut composite = json!({
            "apiVersion": self.composite.api_version(),
            "kind": self.composite.kind,
            "metadata": {
                "name": request.name,
                "labels": request.labels,
            },
            "spec": {
                "compositionRef": { "name": composition },
                "parameters": parameters,
            },
        });
        if let Some(package_id) = request.package_id.as_deref().filter(|p| !p.is_empty()) {
            tree::set_at(&mut composite, &["metadata", "annotations", PACKAGE_ANNOTATION], json!(package_id));
        }

        let client = self.client.get(ctx).await?;
        let created = client
            .create(&self.composite, "", composite)
            .await
            .map_err(|e| AdapterError::backend(BACKEND, "create", &request.name, e))?;
        tracing::info!(adapter = %self.name, composite = %request.name, %composition, "composite created");
        Ok(composite_to_deployment(&created))
    }

    async fn update_deployment(
        &self,
        ctx: &OpContext,
        id: &str,
        update: &DeploymentUpdate,
    ) -> AdapterResult<Deployment> {
        ctx.check()?;
        let composition = optional_str(&update.extensions, "composition")?;
        if let Some(composition) = composition {
            validate_name("extensions.composition", composition)?;
        }
        let mut composite = self.composite(ctx, "update", id).await?;
        for (key, value) in &update.values {
            tree::set_at(&mut composite, &["spec", "parameters", key.as_str()], value.clone());
        }
        for (key, value) in &update.labels {
            tree::set_at(&mut composite, &["metadata", "labels", key.as_str()], json!(value));
        }
        if let Some(composition) = composition {
            tree::set_at(&mut composite, &["spec", "compositionRef", "name"], json!(composition));
        }
        if let Some(package_id) = update.package_id.as_deref().filter(|p| !p.is_empty()) {
            tree::set_at(&mut composite, &["metadata", "annotations", PACKAGE_ANNOTATION], json!(package_id));
        }

        let client = self.client.get(ctx).await?;
        let updated = client
            .update(&self.composite, "", composite)
            .await
            .map_err(|e| deployment_error(BACKEND, "update", id, e))?;
        tracing::info!(adapter = %self.name, composite = %id, "composite updated");
        Ok(composite_to_deployment(&updated))
    }

    async fn delete_deployment(&self, ctx: &OpContext, id: &str) -> AdapterResult<()> {
        ctx.check()?;
        validate_name("id", id)?;
        let client = self.client.get(ctx).await?;
        client
            .delete(&self.composite, "", id)
            .await
            .map_err(|e| deployment_error(BACKEND, "delete", id, e))?;
        tracing::info!(adapter = %self.name, composite = %id, "composite deleted");
        Ok(())
    }

    async fn scale_deployment(&self, ctx: &OpContext, id: &str, replicas: i32) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_replicas(replicas)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "scale",
            "composite resources have no replica count; expose one as a composition parameter and update it",
        ))
    }

    async fn rollback_deployment(&self, ctx: &OpContext, id: &str, revision: i64) -> AdapterResult<Deployment> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_revision(revision)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "rollback",
            "composites keep no deployment history; pin an earlier composition revision with an update instead",
        ))
    }

    async fn deployment_status(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentStatusDetail> {
        ctx.check()?;
        let composite = self.composite(ctx, "status", id).await?;
        let conditions = tree::conditions(&composite);
        let verdict = evaluate(&conditions, tree::is_deleting(&composite));
        let deployment = composite_to_deployment(&composite);
        Ok(DeploymentStatusDetail {
            id: id.to_string(),
            status: verdict.status,
            message: verdict.message,
            progress: verdict.progress,
            updated_at: tree::last_transition(&conditions).unwrap_or_else(Utc::now),
            conditions,
            extensions: deployment.extensions,
        })
    }

    /// Composites are reconciled in place, so the history is the current state.
    async fn deployment_history(&self, ctx: &OpContext, id: &str) -> AdapterResult<DeploymentHistory> {
        ctx.check()?;
        let composite = self.composite(ctx, "history", id).await?;
        let deployment = composite_to_deployment(&composite);
        let version = tree::str_at(&composite, &["spec", "compositionRevisionRef", "name"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("generation {}", deployment.version));
        Ok(DeploymentHistory {
            deployment_id: id.to_string(),
            revisions: vec![DeploymentRevision {
                revision: 0,
                version,
                deployed_at: deployment.updated_at,
                status: deployment.status,
                description: "current state".to_string(),
            }],
        })
    }

    async fn deployment_logs(&self, ctx: &OpContext, id: &str, options: &LogOptions) -> AdapterResult<DeploymentLogs> {
        ctx.check()?;
        validate_name("id", id)?;
        validate_log_options(options)?;
        Err(AdapterError::unsupported(
            BACKEND,
            "logs",
            "composites run no pods of their own; read the provider logs in crossplane-system",
        ))
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
