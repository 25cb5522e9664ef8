//! Boundary to the cluster API for custom resources.
//!
//! Objects travel as untyped `serde_json::Value` trees because their schemas
//! belong to the controllers that define them. Use [`tree`] to read and write
//! attribute paths.

pub mod kube_client;
#[cfg(test)]
pub mod memory;
pub mod tree;

use async_trait::async_trait;
use serde_json::Value;

pub use kube_client::KubeResourceClient;

/// Coordinates of a custom resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn namespaced(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            namespaced: false,
            ..Self::namespaced(group, version, kind, plural)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Log lines of one pod container.
#[derive(Debug, Clone, PartialEq)]
pub struct PodLog {
    pub pod: String,
    pub container: Option<String>,
    pub text: String,
}

/// Generic create/read/update/delete over custom resources.
///
/// `namespace` is ignored for cluster-scoped kinds. Missing objects are
/// reported as [`ClusterError::NotFound`].
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Value, ClusterError>;

    /// `namespace: None` lists across all namespaces.
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError>;

    async fn create(&self, kind: &ResourceKind, namespace: &str, object: Value) -> Result<Value, ClusterError>;

    /// Full replace; the object must carry the `metadata.resourceVersion` it was read at.
    async fn update(&self, kind: &ResourceKind, namespace: &str, object: Value) -> Result<Value, ClusterError>;

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        label_selector: &str,
        container: Option<&str>,
        tail_lines: Option<i64>,
    ) -> Result<Vec<PodLog>, ClusterError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), ClusterError>;
}
