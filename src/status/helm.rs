use super::Verdict;
use crate::helm::ReleaseStatus;
use crate::models::DeploymentStatus;

pub fn evaluate(status: ReleaseStatus) -> Verdict {
    use DeploymentStatus::*;

    match status {
        ReleaseStatus::Deployed => Verdict::new(Deployed, 100, "release is deployed"),
        ReleaseStatus::PendingInstall => Verdict::new(Deploying, 25, "install in progress"),
        ReleaseStatus::PendingUpgrade => Verdict::new(Deploying, 50, "upgrade in progress"),
        ReleaseStatus::PendingRollback => Verdict::new(RollingBack, 50, "rollback in progress"),
        ReleaseStatus::Uninstalling => Verdict::new(Deleting, 50, "uninstall in progress"),
        ReleaseStatus::Uninstalled => Verdict::new(Deleting, 100, "release is uninstalled"),
        ReleaseStatus::Failed => Verdict::new(Failed, 0, "release failed"),
        ReleaseStatus::Superseded => Verdict::new(Failed, 0, "release revision is superseded"),
        ReleaseStatus::Unknown => Verdict::new(Failed, 0, "release status is unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployed_is_complete() {
        let v = evaluate(ReleaseStatus::Deployed);
        assert_eq!(v.status, DeploymentStatus::Deployed);
        assert_eq!(v.progress, 100);
    }

    #[test]
    fn pending_states_progress() {
        assert_eq!(evaluate(ReleaseStatus::PendingInstall).progress, 25);
        assert_eq!(evaluate(ReleaseStatus::PendingUpgrade).progress, 50);
        assert_eq!(
            evaluate(ReleaseStatus::PendingRollback).status,
            DeploymentStatus::RollingBack
        );
        assert_eq!(evaluate(ReleaseStatus::Uninstalling).status, DeploymentStatus::Deleting);
    }

    #[test]
    fn unknown_is_failed() {
        for status in [ReleaseStatus::Unknown, ReleaseStatus::Failed, ReleaseStatus::Superseded] {
            let v = evaluate(status);
            assert_eq!(v.status, DeploymentStatus::Failed);
            assert_eq!(v.progress, 0);
        }
    }
}
