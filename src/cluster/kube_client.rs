use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams,
    PostParams,
};
use serde_json::Value;

use super::{ClusterError, PodLog, ResourceClient, ResourceKind};

/// [`ResourceClient`] over the Kubernetes API using dynamic objects.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Infers configuration from the environment: in-cluster service account
    /// first, then the local kubeconfig.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        match namespace {
            Some(ns) if kind.namespaced && !ns.is_empty() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn map_error(kind: &ResourceKind, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind: kind.kind.clone(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(resp.message),
        other => ClusterError::Kube(other),
    }
}

fn to_tree(obj: DynamicObject) -> Result<Value, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::InvalidObject(e.to_string()))
}

fn from_tree(kind: &ResourceKind, mut object: Value) -> Result<DynamicObject, ClusterError> {
    if let Value::Object(map) = &mut object {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(kind.api_version()));
        map.entry("kind")
            .or_insert_with(|| Value::String(kind.kind.clone()));
    }
    serde_json::from_value(object).map_err(|e| ClusterError::InvalidObject(e.to_string()))
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Value, ClusterError> {
        tracing::debug!(kind = %kind.kind, namespace, name, "get");
        let obj = self
            .api(kind, Some(namespace))
            .get(name)
            .await
            .map_err(|e| map_error(kind, name, e))?;
        to_tree(obj)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        tracing::debug!(kind = %kind.kind, ?namespace, ?label_selector, "list");
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| map_error(kind, "", e))?;
        list.items.into_iter().map(to_tree).collect()
    }

    async fn create(&self, kind: &ResourceKind, namespace: &str, object: Value) -> Result<Value, ClusterError> {
        let obj = from_tree(kind, object)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        tracing::debug!(kind = %kind.kind, namespace, name = %name, "create");
        let created = self
            .api(kind, Some(namespace))
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(kind, &name, e))?;
        to_tree(created)
    }

    async fn update(&self, kind: &ResourceKind, namespace: &str, object: Value) -> Result<Value, ClusterError> {
        let obj = from_tree(kind, object)?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject("metadata.name is required".into()))?;
        tracing::debug!(kind = %kind.kind, namespace, name = %name, "replace");
        let updated = self
            .api(kind, Some(namespace))
            .replace(&name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(kind, &name, e))?;
        to_tree(updated)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        tracing::debug!(kind = %kind.kind, namespace, name, "delete");
        self.api(kind, Some(namespace))
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_error(kind, name, e))?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        label_selector: &str,
        container: Option<&str>,
        tail_lines: Option<i64>,
    ) -> Result<Vec<PodLog>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        let params = LogParams {
            container: container.map(str::to_string),
            tail_lines,
            ..LogParams::default()
        };

        let mut logs = Vec::new();
        for pod in list.items {
            let Some(name) = pod.metadata.name else {
                continue;
            };
            let text = pods.logs(&name, &params).await?;
            logs.push(PodLog {
                pod: name,
                container: container.map(str::to_string),
                text,
            });
        }
        Ok(logs)
    }

    async fn ping(&self) -> Result<(), ClusterError> {
        self.client.apiserver_version().await?;
        Ok(())
    }
}
