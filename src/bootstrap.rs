//! Builds the adapter registry from configuration.
//!
//! Nothing here touches a backend: every client is wrapped in a
//! [`LazyClient`] and connects on first use.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::argocd_rest::ArgocdApiClient;
use crate::adapters::{
    AdapterRegistry, ArgocdAdapter, ArgocdRestAdapter, CrossplaneAdapter, DeploymentAdapter, FluxAdapter,
    HelmAdapter,
};
use crate::cluster::{KubeResourceClient, ResourceClient};
use crate::config::{AdapterConfig, AdapterSettings, GatewayConfig};
use crate::error::AdapterError;
use crate::helm::{HelmCli, ReleaseActions};
use crate::runtime::LazyClient;

fn cluster_client(backend: &'static str) -> LazyClient<dyn ResourceClient> {
    LazyClient::new(backend, move || async move {
        let client = KubeResourceClient::connect()
            .await
            .map_err(|e| AdapterError::backend(backend, "connect", "cluster", e))?;
        Ok(Arc::new(client) as Arc<dyn ResourceClient>)
    })
}

fn helm_client(binary: String, kube_context: Option<String>) -> LazyClient<dyn ReleaseActions> {
    LazyClient::new("helm", move || {
        let (binary, kube_context) = (binary.clone(), kube_context.clone());
        async move {
            let cli = HelmCli::connect(binary, kube_context)
                .await
                .map_err(|e| AdapterError::backend("helm", "connect", "helm", e))?;
            Ok(Arc::new(cli) as Arc<dyn ReleaseActions>)
        }
    })
}

fn argocd_api_client(base_url: String, token: String, namespace: String, timeout: Duration) -> LazyClient<ArgocdApiClient> {
    LazyClient::new("argocd-rest", move || {
        let (base_url, token, namespace) = (base_url.clone(), token.clone(), namespace.clone());
        async move {
            let client = ArgocdApiClient::new(base_url.as_str(), token, namespace, timeout)
                .map_err(|e| AdapterError::backend("argocd-rest", "connect", base_url.as_str(), e))?;
            let version = client
                .version()
                .await
                .map_err(|e| AdapterError::backend("argocd-rest", "connect", base_url.as_str(), e))?;
            tracing::info!(%base_url, "argocd api server {version}");
            Ok(Arc::new(client))
        }
    })
}

/// Adapter for one `[[adapters]]` table.
pub fn build_adapter(config: &AdapterConfig) -> anyhow::Result<Arc<dyn DeploymentAdapter>> {
    let name = config.name.clone();
    let adapter: Arc<dyn DeploymentAdapter> = match &config.settings {
        AdapterSettings::Argocd { namespace } => {
            Arc::new(ArgocdAdapter::new(name, namespace.clone(), cluster_client("argocd")))
        }
        AdapterSettings::ArgocdRest {
            base_url,
            token_env,
            namespace,
            timeout_secs,
        } => {
            let token = std::env::var(token_env)
                .with_context(|| format!("adapter {name}: env var {token_env} is not set"))?;
            let client = argocd_api_client(
                base_url.clone(),
                token,
                namespace.clone(),
                Duration::from_secs(*timeout_secs),
            );
            Arc::new(ArgocdRestAdapter::new(name, namespace.clone(), client))
        }
        AdapterSettings::Crossplane { composite } => Arc::new(CrossplaneAdapter::new(
            name,
            composite.resource_kind(),
            cluster_client("crossplane"),
        )),
        AdapterSettings::Flux { namespace } => {
            Arc::new(FluxAdapter::new(name, namespace.clone(), cluster_client("flux")))
        }
        AdapterSettings::Helm { binary, kube_context } => Arc::new(HelmAdapter::new(
            name,
            helm_client(binary.clone(), kube_context.clone()),
            cluster_client("helm"),
        )),
    };
    Ok(adapter)
}

pub fn build_registry(config: &GatewayConfig) -> anyhow::Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for adapter_config in &config.adapters {
        let adapter = build_adapter(adapter_config)?;
        tracing::info!(adapter = %adapter.name(), kind = %adapter.kind(), "adapter configured");
        registry.register(adapter);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterKind;

    #[test]
    fn builds_without_connecting() {
        let config = GatewayConfig::parse(
            r#"
[[adapters]]
name = "argo"
kind = "argocd"

[[adapters]]
name = "charts"
kind = "helm"
binary = "/nonexistent/helm"

[[adapters]]
name = "platform"
kind = "crossplane"
composite = { group = "platform.example.org", version = "v1alpha1", kind = "XApp", plural = "xapps" }
"#,
        )
        .unwrap();
        let registry = build_registry(&config).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("charts").unwrap().kind(), AdapterKind::Helm);
        assert_eq!(registry.get("platform").unwrap().kind(), AdapterKind::Crossplane);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn rest_variant_requires_its_token() {
        let config = GatewayConfig::parse(
            r#"
[[adapters]]
name = "legacy"
kind = "argocd-rest"
base_url = "https://argocd.example.com"
token_env = "WIDE_DEPLOY_TEST_TOKEN_THAT_IS_NEVER_SET"
"#,
        )
        .unwrap();
        let err = build_registry(&config).err().unwrap();
        assert!(err.to_string().contains("WIDE_DEPLOY_TEST_TOKEN_THAT_IS_NEVER_SET"));
    }

    #[tokio::test]
    async fn helm_setup_failure_surfaces_on_first_use() {
        let config = GatewayConfig::parse(
            "[[adapters]]\nname = \"charts\"\nkind = \"helm\"\nbinary = \"/nonexistent/helm\"\n",
        )
        .unwrap();
        let registry = build_registry(&config).unwrap();
        let adapter = registry.get("charts").unwrap();
        let err = adapter.health(&crate::runtime::OpContext::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
    }
}
