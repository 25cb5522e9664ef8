//! Shared adapter plumbing: cancellation, lazy client setup, listing and ids.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::error::{AdapterError, AdapterResult};
use crate::models::{Deployment, Filter, PackageType};

/// Per-operation context carrying the caller's cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails fast when the caller has already given up.
    pub fn check(&self) -> AdapterResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        Ok(())
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

type Connector<C> = Box<dyn Fn() -> BoxFuture<'static, AdapterResult<Arc<C>>> + Send + Sync>;
type Setup<C> = Shared<BoxFuture<'static, AdapterResult<Arc<C>>>>;

/// Backend client established on first use, at most once per instance.
///
/// The first caller creates a single shared setup future; every caller,
/// including the first, only polls it. A caller that is cancelled stops
/// waiting but leaves the setup for the others to drive, so the connector
/// never runs twice. The outcome, success or failure, is shared by every
/// caller. A failed setup is never retried; build a new adapter instead.
pub struct LazyClient<C: ?Sized> {
    backend: &'static str,
    setup: OnceLock<Setup<C>>,
    connect: Connector<C>,
}

impl<C: ?Sized + Send + Sync + 'static> LazyClient<C> {
    pub fn new<F, Fut>(backend: &'static str, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AdapterResult<Arc<C>>> + Send + 'static,
    {
        Self {
            backend,
            setup: OnceLock::new(),
            connect: Box::new(move || Box::pin(connect())),
        }
    }

    /// Wraps a client that was built eagerly.
    pub fn ready(backend: &'static str, client: Arc<C>) -> Self {
        Self::new(backend, move || {
            let client = client.clone();
            async move { Ok(client) }
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.setup.get().is_some_and(|setup| setup.peek().is_some())
    }

    fn setup(&self) -> Setup<C> {
        self.setup
            .get_or_init(|| {
                let backend = self.backend;
                let connect = (self.connect)();
                async move {
                    tracing::debug!(backend, "connecting backend client");
                    let outcome = connect.await;
                    match &outcome {
                        Ok(_) => tracing::info!(backend, "backend client ready"),
                        Err(e) => tracing::warn!(backend, "backend client setup failed: {e}"),
                    }
                    outcome
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    pub async fn get(&self, ctx: &OpContext) -> AdapterResult<Arc<C>> {
        ctx.check()?;
        let setup = self.setup();
        if let Some(outcome) = setup.peek() {
            return outcome.clone();
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AdapterError::Cancelled),
            outcome = setup => outcome,
        }
    }
}

/// Sub-slice of an ordered result set. `limit == 0` means unbounded and an
/// offset past the end yields an empty page.
pub fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    let rest = items.into_iter().skip(offset);
    if limit == 0 {
        rest.collect()
    } else {
        rest.take(limit).collect()
    }
}

/// Label equality map rendered in the cluster's selector syntax.
pub fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

pub fn labels_match(actual: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|have| have == v))
}

/// Applies namespace, status and (when the backend could not) label filters,
/// orders the result and cuts the requested page.
pub fn finish_deployments(
    mut items: Vec<Deployment>,
    filter: &Filter,
    labels_selected_server_side: bool,
) -> Vec<Deployment> {
    items.retain(|d| {
        let namespace_ok = match filter.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => d.namespace == ns,
            _ => true,
        };
        let status_ok = filter.status.is_none_or(|s| d.status == s);
        let labels_ok = labels_selected_server_side || labels_match(&d.labels, &filter.labels);
        namespace_ok && status_ok && labels_ok
    });
    items.sort_by(|a, b| (&a.namespace, &a.id).cmp(&(&b.namespace, &b.id)));
    paginate(items, filter.limit, filter.offset)
}

/// Stable package id for a `(type, url, path)` triple.
///
/// Backends without a package registry synthesize packages from live
/// resources, so the same source must always produce the same id.
pub fn derive_package_id(package_type: PackageType, url: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(package_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", package_type.id_prefix(), &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeploymentStatus;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn deployment(id: &str, namespace: &str, status: DeploymentStatus) -> Deployment {
        Deployment {
            id: id.into(),
            name: id.into(),
            package_id: String::new(),
            namespace: namespace.into(),
            status,
            version: 1,
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            labels: [("team".to_string(), format!("team-{id}"))].into(),
            extensions: Default::default(),
        }
    }

    #[test]
    fn paginate_basic() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), 3, 0), vec![0, 1, 2]);
        assert_eq!(paginate(items.clone(), 3, 8), vec![8, 9]);
        assert_eq!(paginate(items.clone(), 0, 7), vec![7, 8, 9]);
        assert!(paginate(items.clone(), 5, 10).is_empty());
        assert!(paginate(items, 0, 100).is_empty());
    }

    proptest! {
        #[test]
        fn pagination_law(n in 0usize..60, limit in 0usize..20, offset in 0usize..80) {
            let items: Vec<usize> = (0..n).collect();
            let page = paginate(items, limit, offset);
            let remaining = n.saturating_sub(offset);
            let expected = if limit > 0 { remaining.min(limit) } else { remaining };
            prop_assert_eq!(page.len(), expected);
            if let Some(first) = page.first() {
                prop_assert_eq!(*first, offset);
            }
        }

        #[test]
        fn package_ids_are_deterministic(url in ".{0,40}", path in ".{0,20}") {
            prop_assert_eq!(
                derive_package_id(PackageType::GitRepository, &url, &path),
                derive_package_id(PackageType::GitRepository, &url, &path)
            );
        }

        #[test]
        fn distinct_triples_do_not_collide(
            a in (0usize..3, "[a-z/:.]{0,12}", "[a-z/.]{0,8}"),
            b in (0usize..3, "[a-z/:.]{0,12}", "[a-z/.]{0,8}"),
        ) {
            let types = [PackageType::GitRepository, PackageType::HelmChart, PackageType::CrossplanePackage];
            prop_assume!(a != b);
            prop_assert_ne!(
                derive_package_id(types[a.0], &a.1, &a.2),
                derive_package_id(types[b.0], &b.1, &b.2)
            );
        }
    }

    #[test]
    fn package_id_separates_url_and_path() {
        let a = derive_package_id(PackageType::GitRepository, "https://g/r", "apps");
        let b = derive_package_id(PackageType::GitRepository, "https://g/ra", "pps");
        assert_ne!(a, b);
        assert!(a.starts_with("git-"));
        assert_eq!(a.len(), "git-".len() + 32);
    }

    #[test]
    fn selector_joins_sorted_pairs() {
        let labels: BTreeMap<String, String> =
            [("tier".into(), "web".into()), ("app".into(), "shop".into())].into();
        assert_eq!(label_selector(&labels).as_deref(), Some("app=shop,tier=web"));
        assert_eq!(label_selector(&BTreeMap::new()), None);
    }

    #[test]
    fn finish_filters_before_paging() {
        let items = vec![
            deployment("c", "prod", DeploymentStatus::Deployed),
            deployment("a", "prod", DeploymentStatus::Failed),
            deployment("b", "prod", DeploymentStatus::Deployed),
            deployment("d", "dev", DeploymentStatus::Deployed),
        ];
        let filter = Filter::default()
            .with_namespace("prod")
            .with_status(DeploymentStatus::Deployed)
            .with_page(1, 1);
        let page = finish_deployments(items.clone(), &filter, true);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "c");

        let by_label = Filter::default().with_label("team", "team-d");
        let page = finish_deployments(items.clone(), &by_label, false);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "d");

        // Labels already applied by the backend are not re-checked.
        assert_eq!(finish_deployments(items, &by_label, true).len(), 4);
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let ctx = OpContext::new();
        ctx.token().cancel();
        assert!(matches!(ctx.check(), Err(AdapterError::Cancelled)));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy: LazyClient<String> = LazyClient::new("test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new("client".to_string()))
            }
        });
        assert!(matches!(lazy.get(&ctx).await, Err(AdapterError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!lazy.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_connects_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy: Arc<LazyClient<String>> = Arc::new(LazyClient::new("test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Arc::new("client".to_string()))
            }
        }));

        let a = tokio::spawn({
            let lazy = lazy.clone();
            async move { lazy.get(&OpContext::new()).await }
        });
        let b = tokio::spawn({
            let lazy = lazy.clone();
            async move { lazy.get(&OpContext::new()).await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_initializer_leaves_setup_to_other_waiters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy: Arc<LazyClient<String>> = Arc::new(LazyClient::new("test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Arc::new("client".to_string()))
            }
        }));

        let first_ctx = OpContext::new();
        let first = tokio::spawn({
            let lazy = lazy.clone();
            let ctx = first_ctx.clone();
            async move { lazy.get(&ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let lazy = lazy.clone();
            async move { lazy.get(&OpContext::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        first_ctx.token().cancel();

        assert!(matches!(first.await.unwrap(), Err(AdapterError::Cancelled)));
        assert_eq!(second.await.unwrap().unwrap().as_str(), "client");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_initialized());

        lazy.get(&OpContext::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn setup_failure_is_cached_and_shared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let lazy: Arc<LazyClient<String>> = Arc::new(LazyClient::new("test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(AdapterError::malformed("test", "connect", "cluster", "no kubeconfig"))
            }
        }));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lazy = lazy.clone();
                tokio::spawn(async move { lazy.get(&OpContext::new()).await })
            })
            .collect();
        let mut messages = Vec::new();
        for handle in handles {
            messages.push(handle.await.unwrap().unwrap_err().to_string());
        }
        messages.push(lazy.get(&OpContext::new()).await.unwrap_err().to_string());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(messages.windows(2).all(|w| w[0] == w[1]));
        assert!(messages[0].contains("no kubeconfig"));
    }
}
