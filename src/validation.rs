//! Input checks run before any backend mutation.

use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;

use crate::error::{AdapterError, AdapterResult};
use crate::models::{Extensions, LogOptions};

/// DNS-1123 label: the naming grammar for namespaced cluster resources.
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("valid regex"));

pub const MAX_NAME_LEN: usize = 63;

pub fn validate_name(field: &str, value: &str) -> AdapterResult<()> {
    if value.is_empty() {
        return Err(AdapterError::validation(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(AdapterError::validation(
            field,
            format!("{value:?} is longer than {MAX_NAME_LEN} characters"),
        ));
    }
    if !NAME_RE.is_match(value) {
        return Err(AdapterError::validation(
            field,
            format!(
                "{value:?} must consist of lowercase alphanumerics and '-', and start and end with an alphanumeric"
            ),
        ));
    }
    Ok(())
}

/// Relative source path inside a repository. Empty means the repository root.
pub fn validate_path(field: &str, value: &str) -> AdapterResult<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.starts_with('/') || value.starts_with('\\') || Path::new(value).is_absolute() {
        return Err(AdapterError::validation(
            field,
            format!("{value:?} must be a relative path"),
        ));
    }
    let traverses = value.split(['/', '\\']).any(|segment| segment == "..")
        || Path::new(value)
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if traverses {
        return Err(AdapterError::validation(
            field,
            format!("{value:?} must not contain '..' segments"),
        ));
    }
    Ok(())
}

pub fn validate_replicas(replicas: i32) -> AdapterResult<()> {
    if replicas < 0 {
        return Err(AdapterError::validation(
            "replicas",
            format!("must be >= 0, got {replicas}"),
        ));
    }
    Ok(())
}

pub fn validate_revision(revision: i64) -> AdapterResult<()> {
    if revision < 0 {
        return Err(AdapterError::validation(
            "revision",
            format!("must be >= 0, got {revision}"),
        ));
    }
    Ok(())
}

pub fn validate_log_options(options: &LogOptions) -> AdapterResult<()> {
    if let Some(tail) = options.tail_lines {
        if tail <= 0 {
            return Err(AdapterError::validation(
                "tail_lines",
                format!("must be > 0, got {tail}"),
            ));
        }
    }
    if let Some(container) = options.container.as_deref() {
        validate_name("container", container)?;
    }
    Ok(())
}

/// A required string entry of an extension map.
pub fn required_str<'a>(extensions: &'a Extensions, key: &str) -> AdapterResult<&'a str> {
    match extensions.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(serde_json::Value::String(_)) | None => Err(AdapterError::validation(
            format!("extensions.{key}"),
            "is required",
        )),
        Some(other) => Err(AdapterError::validation(
            format!("extensions.{key}"),
            format!("must be a string, got {other}"),
        )),
    }
}

pub fn optional_str<'a>(extensions: &'a Extensions, key: &str) -> AdapterResult<Option<&'a str>> {
    match extensions.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(AdapterError::validation(
            format!("extensions.{key}"),
            format!("must be a string, got {other}"),
        )),
    }
}

pub fn optional_bool(extensions: &Extensions, key: &str) -> AdapterResult<Option<bool>> {
    match extensions.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(AdapterError::validation(
            format!("extensions.{key}"),
            format!("must be a boolean, got {other}"),
        )),
    }
}
