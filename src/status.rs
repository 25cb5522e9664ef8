//! Native health signals collapsed onto the canonical status.
//!
//! One state machine per backend. Each is total: every input, including
//! empty and unknown values, resolves to exactly one [`DeploymentStatus`].
//!
//! Shared rule for missing or unknown signals: a signal the controller has
//! not reported yet means `pending`; an explicit unknown means `failed`,
//! unless the same snapshot shows outstanding change (out of sync,
//! reconciling), which means `deploying`.

pub mod argocd;
pub mod crossplane;
pub mod flux;
pub mod helm;

use crate::models::DeploymentStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: DeploymentStatus,
    /// Coarse 0-100 estimate for display; never used for control decisions.
    pub progress: u8,
    pub message: String,
}

impl Verdict {
    pub fn new(status: DeploymentStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: progress.min(100),
            message: message.into(),
        }
    }

    pub(crate) fn deleting() -> Self {
        Self::new(DeploymentStatus::Deleting, 50, "resource is being deleted")
    }
}

/// Prefers the backend's own message when it has one.
pub(crate) fn message_or(native: &str, fallback: &str) -> String {
    if native.trim().is_empty() {
        fallback.to_string()
    } else {
        native.trim().to_string()
    }
}
