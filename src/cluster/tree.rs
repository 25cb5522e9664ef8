//! Path accessors over untyped resource trees.
//!
//! Paths are slices of segments so keys containing dots (annotation names)
//! need no escaping. Array elements are addressed by decimal index. Absent
//! paths read as `None`, never as an error.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::DeploymentCondition;

pub fn lookup<'a>(obj: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(obj, |node, segment| match node {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn str_at<'a>(obj: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(obj, path).and_then(Value::as_str)
}

/// Like [`str_at`] but defaults to an empty string.
pub fn string_at(obj: &Value, path: &[&str]) -> String {
    str_at(obj, path).unwrap_or_default().to_string()
}

pub fn i64_at(obj: &Value, path: &[&str]) -> Option<i64> {
    match lookup(obj, path)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn bool_at(obj: &Value, path: &[&str]) -> Option<bool> {
    lookup(obj, path).and_then(Value::as_bool)
}

pub fn array_at<'a>(obj: &'a Value, path: &[&str]) -> &'a [Value] {
    lookup(obj, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub fn time_at(obj: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    str_at(obj, path).and_then(parse_time)
}

pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// String-valued map such as `metadata.labels`. Non-string values are skipped.
pub fn string_map_at(obj: &Value, path: &[&str]) -> BTreeMap<String, String> {
    lookup(obj, path)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Writes `value` at `path`, creating (or replacing non-object) intermediate nodes.
pub fn set_at(obj: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *obj = value;
        return;
    };
    let mut node = obj;
    for segment in parents {
        node = as_object(node)
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    as_object(node).insert(last.to_string(), value);
}

fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    match node {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            as_object(other)
        }
    }
}

pub fn remove_at(obj: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut node = obj;
    for segment in parents {
        node = node.as_object_mut()?.get_mut(*segment)?;
    }
    node.as_object_mut()?.remove(*last)
}

pub fn name(obj: &Value) -> String {
    string_at(obj, &["metadata", "name"])
}

pub fn namespace(obj: &Value) -> String {
    string_at(obj, &["metadata", "namespace"])
}

pub fn labels(obj: &Value) -> BTreeMap<String, String> {
    string_map_at(obj, &["metadata", "labels"])
}

pub fn is_deleting(obj: &Value) -> bool {
    lookup(obj, &["metadata", "deletionTimestamp"]).is_some_and(|v| !v.is_null())
}

pub fn created_at(obj: &Value) -> Option<DateTime<Utc>> {
    time_at(obj, &["metadata", "creationTimestamp"])
}

/// Standard `status.conditions` list in canonical form.
pub fn conditions(obj: &Value) -> Vec<DeploymentCondition> {
    array_at(obj, &["status", "conditions"])
        .iter()
        .map(|c| DeploymentCondition {
            condition_type: string_at(c, &["type"]),
            status: string_at(c, &["status"]),
            reason: string_at(c, &["reason"]),
            message: string_at(c, &["message"]),
            last_transition_time: time_at(c, &["lastTransitionTime"]),
        })
        .collect()
}

pub fn find_condition<'a>(
    conditions: &'a [DeploymentCondition],
    condition_type: &str,
) -> Option<&'a DeploymentCondition> {
    conditions
        .iter()
        .find(|c| c.condition_type.eq_ignore_ascii_case(condition_type))
}

/// Latest transition time among the conditions.
pub fn last_transition(conditions: &[DeploymentCondition]) -> Option<DateTime<Utc>> {
    conditions.iter().filter_map(|c| c.last_transition_time).max()
}
