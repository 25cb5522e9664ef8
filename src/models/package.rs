use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::deployment::Extensions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    GitRepository,
    HelmChart,
    CrossplanePackage,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::GitRepository => "git-repository",
            PackageType::HelmChart => "helm-chart",
            PackageType::CrossplanePackage => "crossplane-package",
        }
    }

    /// Short prefix used in derived package ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            PackageType::GitRepository => "git",
            PackageType::HelmChart => "chart",
            PackageType::CrossplanePackage => "xpkg",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployable artifact reference: a Git source, a chart or a package bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPackage {
    pub id: String,
    pub name: String,
    pub version: String,
    pub package_type: PackageType,
    pub description: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageUpload {
    pub name: String,
    /// OCI reference or repository URL of the artifact.
    pub reference: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub extensions: Extensions,
}

/// Operations a backend declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    PackageManagement,
    DeploymentLifecycle,
    Rollback,
    Scaling,
    #[serde(rename = "gitops")]
    GitOps,
    HealthChecks,
    Metrics,
}
