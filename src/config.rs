use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::cluster::ResourceKind;
use crate::validation::validate_name;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "WIDE_DEPLOY_CONFIG";
/// Env var overriding `server.listen`.
pub const LISTEN_ENV: &str = "WIDE_DEPLOY_LISTEN";

pub const DEFAULT_CONFIG_PATH: &str = "./gateway.toml";

/// Top-level config loaded from `gateway.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Operations still running after this many seconds are cancelled. 0 = no limit.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// One `[[adapters]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: AdapterSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AdapterSettings {
    Argocd {
        #[serde(default = "default_argocd_namespace")]
        namespace: String,
    },
    ArgocdRest {
        base_url: String,
        /// Name of the env var holding the bearer token.
        #[serde(default = "default_token_env")]
        token_env: String,
        #[serde(default = "default_argocd_namespace")]
        namespace: String,
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
    Crossplane {
        composite: CompositeConfig,
    },
    Flux {
        #[serde(default = "default_flux_namespace")]
        namespace: String,
    },
    Helm {
        #[serde(default = "default_helm_binary")]
        binary: String,
        kube_context: Option<String>,
    },
}

fn default_argocd_namespace() -> String {
    "argocd".to_string()
}

fn default_flux_namespace() -> String {
    "flux-system".to_string()
}

fn default_token_env() -> String {
    "ARGOCD_AUTH_TOKEN".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

/// Cluster-scoped composite resource type a Crossplane adapter manages.
#[derive(Debug, Clone, Deserialize)]
pub struct CompositeConfig {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl CompositeConfig {
    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::cluster_scoped(&self.group, &self.version, &self.kind, &self.plural)
    }
}

impl GatewayConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `WIDE_DEPLOY_CONFIG` (or `./gateway.toml`) and applies
    /// `WIDE_DEPLOY_LISTEN`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Ok(Self::load(path)?.with_listen(std::env::var(LISTEN_ENV).ok()))
    }

    pub fn with_listen(mut self, listen: Option<String>) -> Self {
        if let Some(listen) = listen.filter(|l| !l.trim().is_empty()) {
            self.server.listen = listen;
        }
        self
    }

    /// Adapter names end up in URLs, so they follow resource naming rules
    /// and must be unique.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = BTreeSet::new();
        for adapter in &self.adapters {
            validate_name("adapters.name", &adapter.name)?;
            if !seen.insert(adapter.name.as_str()) {
                anyhow::bail!("adapter {} is declared more than once", adapter.name);
            }
            if let AdapterSettings::ArgocdRest { base_url, .. } = &adapter.settings {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    anyhow::bail!("adapter {}: base_url must be an http(s) URL", adapter.name);
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.server.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
