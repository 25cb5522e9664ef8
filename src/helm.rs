//! Boundary to the package manager's release actions.

pub mod cli;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use cli::HelmCli;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseStatus {
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Unrecognised values fold into `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "uninstalled" => ReleaseStatus::Uninstalled,
            "superseded" => ReleaseStatus::Superseded,
            "failed" => ReleaseStatus::Failed,
            "uninstalling" => ReleaseStatus::Uninstalling,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }
}

/// Snapshot of one release revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: i64,
    pub chart: String,
    pub chart_version: String,
    pub app_version: String,
    pub status: ReleaseStatus,
    pub first_deployed: Option<DateTime<Utc>>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub description: String,
    /// User-supplied values of this revision.
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub version: Option<String>,
    pub repo: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub create_namespace: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub version: Option<String>,
    pub repo: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub reuse_values: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum HelmError {
    #[error("release not found: {0}")]
    NotFound(String),

    #[error("helm {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("could not run helm: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not decode helm output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected helm output: {0}")]
    Parse(String),
}

/// Stateful release actions of the package manager SDK.
#[async_trait]
pub trait ReleaseActions: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<Release, HelmError>;

    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Release, HelmError>;

    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), HelmError>;

    /// Rolls back to the given release revision number.
    async fn rollback(&self, namespace: &str, name: &str, revision: i64) -> Result<(), HelmError>;

    /// Current revision of a release.
    async fn status(&self, namespace: &str, name: &str) -> Result<Release, HelmError>;

    /// `namespace: None` lists every namespace.
    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<Release>, HelmError>;

    /// All stored revisions, oldest first.
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Release>, HelmError>;

    async fn version(&self) -> Result<String, HelmError>;
}
