//! In-process [`ReleaseActions`] used by adapter tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{HelmError, InstallRequest, Release, ReleaseActions, ReleaseStatus, UpgradeRequest};

/// Releases keyed by `(namespace, name)`, each with its full revision list.
#[derive(Default)]
pub struct MemoryReleases {
    releases: Mutex<BTreeMap<(String, String), Vec<Release>>>,
    installs: Mutex<Vec<InstallRequest>>,
    upgrades: Mutex<Vec<UpgradeRequest>>,
    calls: AtomicUsize,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn split_reference(chart: &str) -> String {
    chart.rsplit('/').next().unwrap_or(chart).to_string()
}

impl MemoryReleases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seeds a release history, oldest first. Not counted as a call.
    pub fn seed(&self, history: Vec<Release>) {
        if let Some(first) = history.first() {
            let k = key(&first.namespace, &first.name);
            self.releases.lock().unwrap().insert(k, history);
        }
    }

    pub fn release(name: &str, namespace: &str, revision: i64, chart: &str, version: &str) -> Release {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(revision);
        Release {
            name: name.into(),
            namespace: namespace.into(),
            revision,
            chart: chart.into(),
            chart_version: version.into(),
            app_version: String::new(),
            status: ReleaseStatus::Deployed,
            first_deployed: Some(at),
            last_deployed: Some(at),
            description: format!("revision {revision}"),
            config: Map::new(),
        }
    }

    pub fn latest(&self, namespace: &str, name: &str) -> Option<Release> {
        self.releases
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .and_then(|h| h.last().cloned())
    }

    pub fn last_install(&self) -> Option<InstallRequest> {
        self.installs.lock().unwrap().last().cloned()
    }

    pub fn last_upgrade(&self) -> Option<UpgradeRequest> {
        self.upgrades.lock().unwrap().last().cloned()
    }

    fn push(&self, mut next: Release) -> Release {
        let mut releases = self.releases.lock().unwrap();
        let history = releases.entry(key(&next.namespace, &next.name)).or_default();
        for old in history.iter_mut() {
            if old.status == ReleaseStatus::Deployed {
                old.status = ReleaseStatus::Superseded;
            }
        }
        next.revision = history.len() as i64 + 1;
        history.push(next.clone());
        next
    }
}

fn to_config(values: &BTreeMap<String, Value>) -> Map<String, Value> {
    values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[async_trait]
impl ReleaseActions for MemoryReleases {
    async fn install(&self, request: &InstallRequest) -> Result<Release, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.installs.lock().unwrap().push(request.clone());
        if self.latest(&request.namespace, &request.name).is_some() {
            return Err(HelmError::Command {
                command: "install".into(),
                stderr: format!("cannot re-use a name that is still in use: {}", request.name),
            });
        }
        let mut release = Self::release(
            &request.name,
            &request.namespace,
            1,
            &split_reference(&request.chart),
            request.version.as_deref().unwrap_or("1.0.0"),
        );
        release.config = to_config(&request.values);
        release.first_deployed = Some(Utc::now());
        release.last_deployed = release.first_deployed;
        Ok(self.push(release))
    }

    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Release, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.upgrades.lock().unwrap().push(request.clone());
        let Some(current) = self.latest(&request.namespace, &request.name) else {
            return Err(HelmError::NotFound(request.name.clone()));
        };
        let mut next = current.clone();
        next.chart = split_reference(&request.chart);
        if let Some(version) = &request.version {
            next.chart_version = version.clone();
        }
        if !request.reuse_values {
            next.config = Map::new();
        }
        next.config.extend(to_config(&request.values));
        next.status = ReleaseStatus::Deployed;
        next.last_deployed = Some(Utc::now());
        next.description = "Upgrade complete".into();
        Ok(self.push(next))
    }

    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.releases
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| HelmError::NotFound(name.to_string()))
    }

    async fn rollback(&self, namespace: &str, name: &str, revision: i64) -> Result<(), HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let target = self
            .releases
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .and_then(|h| h.iter().find(|r| r.revision == revision).cloned());
        let Some(mut target) = target else {
            return Err(HelmError::NotFound(format!("{name} revision {revision}")));
        };
        target.status = ReleaseStatus::Deployed;
        target.description = format!("Rollback to {revision}");
        self.push(target);
        Ok(())
    }

    async fn status(&self, namespace: &str, name: &str) -> Result<Release, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.latest(namespace, name)
            .ok_or_else(|| HelmError::NotFound(name.to_string()))
    }

    async fn list(&self, namespace: Option<&str>, _selector: Option<&str>) -> Result<Vec<Release>, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .releases
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns.as_str()))
            .filter_map(|(_, history)| history.last().cloned())
            .collect())
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Release>, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.releases
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| HelmError::NotFound(name.to_string()))
    }

    async fn version(&self) -> Result<String, HelmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("v3.14.0".into())
    }
}
