use super::{Verdict, message_or};
use crate::cluster::tree::find_condition;
use crate::models::{DeploymentCondition, DeploymentStatus};

fn is(conditions: &[DeploymentCondition], condition_type: &str, status: &str) -> Option<String> {
    find_condition(conditions, condition_type)
        .filter(|c| c.status.eq_ignore_ascii_case(status))
        .map(|c| message_or(&c.message, &c.reason))
}

/// Scans the condition list of a composite resource or package.
///
/// A missing decisive condition means the controller is still working,
/// never "unknown".
pub fn evaluate(conditions: &[DeploymentCondition], deleting: bool) -> Verdict {
    use DeploymentStatus::*;

    if deleting {
        return Verdict::deleting();
    }
    if let Some(message) = is(conditions, "Healthy", "False") {
        return Verdict::new(Failed, 0, message_or(&message, "package is unhealthy"));
    }
    if let Some(message) = is(conditions, "Synced", "False") {
        return Verdict::new(Failed, 0, message_or(&message, "reconcile error"));
    }
    for decisive in ["Healthy", "Installed", "Ready"] {
        if let Some(message) = is(conditions, decisive, "True") {
            return Verdict::new(Deployed, 100, message_or(&message, &format!("{decisive} condition is true")));
        }
    }
    if is(conditions, "Synced", "True").is_some() {
        Verdict::new(Deploying, 75, "waiting for composed resources to become ready")
    } else {
        Verdict::new(Deploying, 25, "waiting for the composition to be applied")
    }
}
