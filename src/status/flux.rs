use super::{Verdict, message_or};
use crate::cluster::tree::find_condition;
use crate::models::{DeploymentCondition, DeploymentStatus};

/// `Ready=False` reasons that mean "not done yet" rather than "broken".
const TRANSIENT_REASONS: &[&str] = &[
    "Progressing",
    "ProgressingWithRetry",
    "DependencyNotReady",
    "ArtifactNotFound",
    "ReconciliationInProgress",
];

pub fn is_transient(reason: &str) -> bool {
    TRANSIENT_REASONS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(reason.trim()))
}

/// Maps the `Ready` condition of a Kustomization or HelmRelease.
pub fn evaluate(conditions: &[DeploymentCondition], suspended: bool, deleting: bool) -> Verdict {
    use DeploymentStatus::*;

    if deleting {
        return Verdict::deleting();
    }
    if suspended {
        return Verdict::new(Pending, 10, "reconciliation is suspended");
    }

    let reconciling = find_condition(conditions, "Reconciling")
        .is_some_and(|c| c.status.eq_ignore_ascii_case("true"));

    match find_condition(conditions, "Ready") {
        Some(ready) if ready.status.eq_ignore_ascii_case("true") => {
            Verdict::new(Deployed, 100, message_or(&ready.message, "reconciliation succeeded"))
        }
        Some(ready) if ready.status.eq_ignore_ascii_case("false") => {
            if is_transient(&ready.reason) {
                Verdict::new(Deploying, 50, message_or(&ready.message, "reconciliation in progress"))
            } else {
                Verdict::new(Failed, 0, message_or(&ready.message, &format!("reconciliation failed: {}", ready.reason)))
            }
        }
        _ if reconciling => Verdict::new(Deploying, 40, "reconciliation in progress"),
        _ => Verdict::new(Pending, 10, "waiting for reconciliation"),
    }
}
