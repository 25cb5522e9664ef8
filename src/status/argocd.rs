use serde_json::Value;

use super::{Verdict, message_or};
use crate::cluster::tree;
use crate::models::DeploymentStatus;

/// The parts of an Application's status that drive the mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppSignals<'a> {
    pub health: Option<&'a str>,
    pub health_message: Option<&'a str>,
    pub sync: Option<&'a str>,
    pub operation_phase: Option<&'a str>,
    pub operation_message: Option<&'a str>,
    pub deleting: bool,
}

impl<'a> AppSignals<'a> {
    pub fn from_application(app: &'a Value) -> Self {
        Self {
            health: tree::str_at(app, &["status", "health", "status"]),
            health_message: tree::str_at(app, &["status", "health", "message"]),
            sync: tree::str_at(app, &["status", "sync", "status"]),
            operation_phase: tree::str_at(app, &["status", "operationState", "phase"]),
            operation_message: tree::str_at(app, &["status", "operationState", "message"]),
            deleting: tree::is_deleting(app),
        }
    }
}

pub fn evaluate(signals: &AppSignals<'_>) -> Verdict {
    use DeploymentStatus::*;

    if signals.deleting {
        return Verdict::deleting();
    }

    let sync = signals.sync.unwrap_or_default().trim().to_ascii_lowercase();
    let synced = sync == "synced";
    let out_of_sync = sync == "outofsync";
    let health = signals
        .health
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty());
    let native = signals.health_message.unwrap_or_default();

    let mut verdict = match health.as_deref() {
        Some("healthy") if synced => Verdict::new(Deployed, 100, message_or(native, "application is healthy and synced")),
        Some("healthy") => Verdict::new(Deploying, 75, "application is healthy but not yet synced"),
        Some("progressing") => Verdict::new(Deploying, 50, message_or(native, "application is progressing")),
        Some("degraded") => Verdict::new(Failed, 0, message_or(native, "application is degraded")),
        Some("missing") => Verdict::new(Failed, 0, message_or(native, "application resources are missing")),
        Some("suspended") => Verdict::new(Pending, 10, message_or(native, "application is suspended")),
        Some(_) if out_of_sync => Verdict::new(Deploying, 25, "health unknown, sync pending"),
        Some(other) => Verdict::new(Failed, 0, message_or(native, &format!("health status {other}"))),
        None if out_of_sync => Verdict::new(Deploying, 25, "waiting for sync"),
        None => Verdict::new(Pending, 0, "waiting for health assessment"),
    };

    let phase = signals.operation_phase.unwrap_or_default().to_ascii_lowercase();
    let op_message = signals.operation_message.unwrap_or_default();
    match phase.as_str() {
        "running" | "terminating" if verdict.status != Failed => {
            verdict.status = Deploying;
            verdict.progress = verdict.progress.clamp(50, 90);
            verdict.message = message_or(op_message, "sync operation running");
        }
        "failed" | "error" if verdict.status == Deploying => {
            verdict = Verdict::new(Failed, 0, message_or(op_message, "sync operation failed"));
        }
        _ => {}
    }
    verdict
}
