//! In-process [`ResourceClient`] used by adapter tests.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::tree;
use super::{ClusterError, PodLog, ResourceClient, ResourceKind};

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryResourceClient {
    objects: Mutex<BTreeMap<Key, Value>>,
    logs: Mutex<BTreeMap<(String, String), Vec<PodLog>>>,
    rejected_updates: Mutex<Vec<String>>,
    calls: AtomicUsize,
    resource_version: AtomicU64,
}

fn key(kind: &ResourceKind, namespace: &str, name: &str) -> Key {
    let namespace = if kind.namespaced { namespace } else { "" };
    (kind.plural.clone(), namespace.to_string(), name.to_string())
}

fn selector_matches(obj: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = tree::labels(obj);
    selector
        .split(',')
        .filter(|pair| !pair.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|have| have == v),
            None => labels.contains_key(pair),
        })
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend calls served so far. Seeding does not count.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Stores an object as-is, filling in the bookkeeping metadata the API
    /// server would set.
    pub fn seed(&self, kind: &ResourceKind, mut object: Value) {
        let name = tree::name(&object);
        let namespace = tree::namespace(&object);
        if tree::lookup(&object, &["metadata", "creationTimestamp"]).is_none() {
            tree::set_at(&mut object, &["metadata", "creationTimestamp"], json!("2024-01-01T00:00:00Z"));
        }
        tree::set_at(&mut object, &["metadata", "resourceVersion"], json!(self.next_version()));
        self.objects
            .lock()
            .unwrap()
            .insert(key(kind, &namespace, &name), object);
    }

    pub fn object(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(kind, namespace, name))
            .cloned()
    }

    /// Makes every update of `kind` fail with a conflict.
    pub fn reject_updates(&self, kind: &ResourceKind) {
        self.rejected_updates.lock().unwrap().push(kind.plural.clone());
    }

    pub fn set_logs(&self, namespace: &str, selector: &str, logs: Vec<PodLog>) {
        self.logs
            .lock()
            .unwrap()
            .insert((namespace.to_string(), selector.to_string()), logs);
    }
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Value, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.object(kind, namespace, name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: kind.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((plural, ns, _), _)| {
                plural == &kind.plural
                    && (!kind.namespaced || namespace.is_none_or(|want| want == ns.as_str()))
            })
            .map(|(_, obj)| obj)
            .filter(|obj| selector_matches(obj, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, kind: &ResourceKind, namespace: &str, mut object: Value) -> Result<Value, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = tree::name(&object);
        if name.is_empty() {
            return Err(ClusterError::InvalidObject("metadata.name is required".into()));
        }
        let k = key(kind, namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&k) {
            return Err(ClusterError::Conflict(format!("{} {name} already exists", kind.kind)));
        }
        if kind.namespaced {
            tree::set_at(&mut object, &["metadata", "namespace"], json!(namespace));
        }
        tree::set_at(&mut object, &["apiVersion"], json!(kind.api_version()));
        tree::set_at(&mut object, &["kind"], json!(kind.kind));
        tree::set_at(&mut object, &["metadata", "creationTimestamp"], json!(Utc::now().to_rfc3339()));
        tree::set_at(&mut object, &["metadata", "generation"], json!(1));
        tree::set_at(&mut object, &["metadata", "resourceVersion"], json!(self.next_version()));
        objects.insert(k, object.clone());
        Ok(object)
    }

    async fn update(&self, kind: &ResourceKind, namespace: &str, mut object: Value) -> Result<Value, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = tree::name(&object);
        if self.rejected_updates.lock().unwrap().contains(&kind.plural) {
            return Err(ClusterError::Conflict(format!("{} {name} was modified", kind.kind)));
        }
        let k = key(kind, namespace, &name);
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&k) else {
            return Err(ClusterError::NotFound {
                kind: kind.kind.clone(),
                name,
            });
        };
        let stored_version = tree::string_at(current, &["metadata", "resourceVersion"]);
        let sent_version = tree::string_at(&object, &["metadata", "resourceVersion"]);
        if !sent_version.is_empty() && sent_version != stored_version {
            return Err(ClusterError::Conflict(format!("{} {name} was modified", kind.kind)));
        }
        let generation = tree::i64_at(current, &["metadata", "generation"]).unwrap_or(1);
        tree::set_at(&mut object, &["metadata", "generation"], json!(generation + 1));
        tree::set_at(&mut object, &["metadata", "resourceVersion"], json!(self.next_version()));
        objects.insert(k, object.clone());
        Ok(object)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .remove(&key(kind, namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: kind.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        label_selector: &str,
        _container: Option<&str>,
        _tail_lines: Option<i64>,
    ) -> Result<Vec<PodLog>, ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), label_selector.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), ClusterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
