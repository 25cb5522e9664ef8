use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Backend-specific fields carried alongside the canonical ones.
pub type Extensions = BTreeMap<String, serde_json::Value>;

/// Canonical deployment status shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Deployed,
    Failed,
    RollingBack,
    Deleting,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 6] = [
        DeploymentStatus::Pending,
        DeploymentStatus::Deploying,
        DeploymentStatus::Deployed,
        DeploymentStatus::Failed,
        DeploymentStatus::RollingBack,
        DeploymentStatus::Deleting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RollingBack => "rolling-back",
            DeploymentStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown deployment status: {s}"))
    }
}

/// A running workload instance managed by one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Backend resource name. Stable for the lifetime of the deployment.
    pub id: String,
    pub name: String,
    pub package_id: String,
    pub namespace: String,
    pub status: DeploymentStatus,
    /// Revision counter as reported by the backend.
    pub version: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub package_id: Option<String>,
    /// Free-form configuration overrides.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// Merged into the existing labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusDetail {
    pub id: String,
    pub status: DeploymentStatus,
    pub message: String,
    /// Coarse 0-100 estimate, display only.
    pub progress: u8,
    pub conditions: Vec<DeploymentCondition>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRevision {
    /// Position in the history, oldest first.
    pub revision: i64,
    pub version: String,
    pub deployed_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentHistory {
    pub deployment_id: String,
    pub revisions: Vec<DeploymentRevision>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub tail_lines: Option<i64>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub pod: String,
    pub container: Option<String>,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLogs {
    pub deployment_id: String,
    pub entries: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in DeploymentStatus::ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("unknown".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn request_defaults_optional_maps() {
        let req: DeploymentRequest =
            serde_json::from_str(r#"{"name":"web","namespace":"prod"}"#).unwrap();
        assert!(req.values.is_empty());
        assert!(req.extensions.is_empty());
        assert!(req.package_id.is_none());
    }
}
