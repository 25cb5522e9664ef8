use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use tokio::process::Command;

use super::{HelmError, InstallRequest, Release, ReleaseActions, ReleaseStatus, UpgradeRequest};
use crate::cluster::tree;

/// [`ReleaseActions`] backed by the `helm` binary and its JSON output.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
    kube_context: Option<String>,
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>, kube_context: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            kube_context,
        }
    }

    /// Builds the client and checks the binary answers.
    pub async fn connect(binary: impl Into<PathBuf>, kube_context: Option<String>) -> Result<Self, HelmError> {
        let cli = Self::new(binary, kube_context);
        let version = cli.version().await?;
        tracing::info!("using helm {version}");
        Ok(cli)
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, HelmError> {
        let command = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        tracing::debug!(%command, "running helm");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        if let Some(context) = &self.kube_context {
            cmd.arg("--kube-context").arg(context);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(command, stderr));
        }
        Ok(output.stdout)
    }

    async fn run_json(&self, args: &[String]) -> Result<Value, HelmError> {
        let stdout = self.run(args).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }
}

/// Only a missing release maps to [`HelmError::NotFound`]; a missing repo,
/// chart or namespace is a command failure like any other.
pub(crate) fn classify_failure(command: String, stderr: String) -> HelmError {
    let release_missing = stderr
        .lines()
        .any(|line| line.trim_end().ends_with("release: not found"));
    if release_missing {
        HelmError::NotFound(stderr)
    } else {
        HelmError::Command { command, stderr }
    }
}

fn values_args(values: &std::collections::BTreeMap<String, Value>) -> Result<Vec<String>, HelmError> {
    let mut args = Vec::with_capacity(values.len() * 2);
    for (key, value) in values {
        args.push("--set-json".to_string());
        args.push(format!("{key}={}", serde_json::to_string(value)?));
    }
    Ok(args)
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn install_args(request: &InstallRequest) -> Result<Vec<String>, HelmError> {
    let mut args = owned(&[
        "install",
        &request.name,
        &request.chart,
        "--namespace",
        &request.namespace,
        "--output",
        "json",
    ]);
    if request.create_namespace {
        args.push("--create-namespace".into());
    }
    if let Some(version) = &request.version {
        args.extend(owned(&["--version", version]));
    }
    if let Some(repo) = &request.repo {
        args.extend(owned(&["--repo", repo]));
    }
    args.extend(values_args(&request.values)?);
    Ok(args)
}

pub(crate) fn upgrade_args(request: &UpgradeRequest) -> Result<Vec<String>, HelmError> {
    let mut args = owned(&[
        "upgrade",
        &request.name,
        &request.chart,
        "--namespace",
        &request.namespace,
        "--output",
        "json",
    ]);
    if request.reuse_values {
        args.push("--reuse-values".into());
    }
    if let Some(version) = &request.version {
        args.extend(owned(&["--version", version]));
    }
    if let Some(repo) = &request.repo {
        args.extend(owned(&["--repo", repo]));
    }
    args.extend(values_args(&request.values)?);
    Ok(args)
}

/// Splits `nginx-15.0.0` into chart name and version.
pub(crate) fn split_chart(chart: &str) -> (String, String) {
    let split = chart
        .char_indices()
        .find(|(i, c)| *c == '-' && chart[i + 1..].starts_with(|n: char| n.is_ascii_digit()));
    match split {
        Some((i, _)) => (chart[..i].to_string(), chart[i + 1..].to_string()),
        None => (chart.to_string(), String::new()),
    }
}

/// Helm prints list timestamps in Go's default layout, e.g.
/// `2024-05-01 10:00:00.123456 +0000 UTC`; history uses RFC 3339.
pub(crate) fn parse_helm_time(s: &str) -> Option<DateTime<Utc>> {
    if let Some(t) = tree::parse_time(s) {
        return Some(t);
    }
    let mut parts = s.split_whitespace();
    let (date, time, offset) = (parts.next()?, parts.next()?, parts.next()?);
    let stamp = format!("{date} {time} {offset}");
    DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S%.f %z")
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Full release document as printed by `status`, `install` and `upgrade`.
pub(crate) fn parse_release(doc: &Value) -> Result<Release, HelmError> {
    let name = tree::string_at(doc, &["name"]);
    if name.is_empty() {
        return Err(HelmError::Parse("release without a name".into()));
    }
    Ok(Release {
        name,
        namespace: tree::string_at(doc, &["namespace"]),
        revision: tree::i64_at(doc, &["version"]).unwrap_or_default(),
        chart: tree::string_at(doc, &["chart", "metadata", "name"]),
        chart_version: tree::string_at(doc, &["chart", "metadata", "version"]),
        app_version: tree::string_at(doc, &["chart", "metadata", "appVersion"]),
        status: ReleaseStatus::parse(tree::str_at(doc, &["info", "status"]).unwrap_or_default()),
        first_deployed: tree::str_at(doc, &["info", "first_deployed"]).and_then(parse_helm_time),
        last_deployed: tree::str_at(doc, &["info", "last_deployed"]).and_then(parse_helm_time),
        description: tree::string_at(doc, &["info", "description"]),
        config: tree::lookup(doc, &["config"])
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

/// One row of `helm list`.
pub(crate) fn parse_list_entry(row: &Value) -> Release {
    let (chart, chart_version) = split_chart(tree::str_at(row, &["chart"]).unwrap_or_default());
    let updated = tree::str_at(row, &["updated"]).and_then(parse_helm_time);
    Release {
        name: tree::string_at(row, &["name"]),
        namespace: tree::string_at(row, &["namespace"]),
        revision: tree::i64_at(row, &["revision"]).unwrap_or_default(),
        chart,
        chart_version,
        app_version: tree::string_at(row, &["app_version"]),
        status: ReleaseStatus::parse(tree::str_at(row, &["status"]).unwrap_or_default()),
        first_deployed: None,
        last_deployed: updated,
        description: String::new(),
        config: Default::default(),
    }
}

/// One row of `helm history`.
pub(crate) fn parse_history_entry(name: &str, namespace: &str, row: &Value) -> Release {
    let (chart, chart_version) = split_chart(tree::str_at(row, &["chart"]).unwrap_or_default());
    Release {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision: tree::i64_at(row, &["revision"]).unwrap_or_default(),
        chart,
        chart_version,
        app_version: tree::string_at(row, &["app_version"]),
        status: ReleaseStatus::parse(tree::str_at(row, &["status"]).unwrap_or_default()),
        first_deployed: None,
        last_deployed: tree::str_at(row, &["updated"]).and_then(parse_helm_time),
        description: tree::string_at(row, &["description"]),
        config: Default::default(),
    }
}

#[async_trait]
impl ReleaseActions for HelmCli {
    async fn install(&self, request: &InstallRequest) -> Result<Release, HelmError> {
        parse_release(&self.run_json(&install_args(request)?).await?)
    }

    async fn upgrade(&self, request: &UpgradeRequest) -> Result<Release, HelmError> {
        parse_release(&self.run_json(&upgrade_args(request)?).await?)
    }

    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), HelmError> {
        self.run(&owned(&["uninstall", name, "--namespace", namespace]))
            .await?;
        Ok(())
    }

    async fn rollback(&self, namespace: &str, name: &str, revision: i64) -> Result<(), HelmError> {
        let revision = revision.to_string();
        self.run(&owned(&["rollback", name, &revision, "--namespace", namespace]))
            .await?;
        Ok(())
    }

    async fn status(&self, namespace: &str, name: &str) -> Result<Release, HelmError> {
        let doc = self
            .run_json(&owned(&["status", name, "--namespace", namespace, "--output", "json"]))
            .await?;
        parse_release(&doc)
    }

    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<Release>, HelmError> {
        let mut args = owned(&["list", "--all", "--output", "json"]);
        match namespace {
            Some(ns) => args.extend(owned(&["--namespace", ns])),
            None => args.push("--all-namespaces".into()),
        }
        if let Some(selector) = selector {
            args.extend(owned(&["--selector", selector]));
        }
        let rows = self.run_json(&args).await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| HelmError::Parse("list output is not an array".into()))?;
        Ok(rows.iter().map(parse_list_entry).collect())
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<Release>, HelmError> {
        let rows = self
            .run_json(&owned(&["history", name, "--namespace", namespace, "--output", "json"]))
            .await?;
        let rows = rows
            .as_array()
            .ok_or_else(|| HelmError::Parse("history output is not an array".into()))?;
        let mut history: Vec<Release> = rows
            .iter()
            .map(|row| parse_history_entry(name, namespace, row))
            .collect();
        history.sort_by_key(|r| r.revision);
        Ok(history)
    }

    async fn version(&self) -> Result<String, HelmError> {
        let stdout = self.run(&owned(&["version", "--short"])).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}
