//! Resource-event watcher: wait until a named object satisfies a predicate.
//!
//! Every exit path (match, timeout, stream error) releases the underlying
//! watch connection exactly once through [`WatchHandle`]'s abort guard.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt};
use k8test_core::ResourceError;
use kube::ResourceExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ResourceEvent<K> {
    pub kind: EventKind,
    pub object: K,
}

/// Items produced by a watch.
#[derive(Debug, Clone)]
pub enum WatchItem<K> {
    Event(ResourceEvent<K>),
    /// A (re)list completed and the target object was not in it.
    Absent,
}

/// Identifies the single object a watch is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub api_path: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl WatchTarget {
    fn matches<K: kube::Resource>(&self, obj: &K) -> bool {
        obj.name_any() == self.name && obj.namespace() == self.namespace
    }

    fn timeout_error(&self, timeout: Duration) -> ResourceError {
        ResourceError::WatchTimeout {
            api_path: self.api_path.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_else(|| "-".to_string()),
            timeout_secs: timeout.as_secs(),
        }
    }
}

/// Runs the abort callback once, when dropped.
struct AbortGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(abort) = self.0.take() {
            abort();
        }
    }
}

/// An open watch: its event stream plus the callback that tears the connection down.
pub struct WatchHandle<K> {
    events: BoxStream<'static, Result<WatchItem<K>>>,
    guard: AbortGuard,
}

impl<K> WatchHandle<K> {
    pub fn new(events: BoxStream<'static, Result<WatchItem<K>>>, abort: impl FnOnce() + Send + 'static) -> Self {
        Self { events, guard: AbortGuard(Some(Box::new(abort))) }
    }

    /// Close the watch now instead of on drop.
    pub fn abort(self) {
        drop(self);
    }
}

/// Opens watches. Implemented by the kube adapter and by test doubles.
#[async_trait::async_trait]
pub trait WatchSource<K>: Send + Sync {
    async fn open(&self, target: &WatchTarget) -> Result<WatchHandle<K>>;
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Hard upper bound for one wait.
    pub timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(60) }
    }
}

impl WatchConfig {
    /// Reads `K8TEST_WATCH_TIMEOUT_SECS` (default 60).
    pub fn from_env() -> Self {
        let secs = std::env::var("K8TEST_WATCH_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(60);
        Self { timeout: Duration::from_secs(secs) }
    }
}

/// Resolve with the first event for `target` accepted by `predicate`.
pub async fn wait_for_resource<K, P>(source: &dyn WatchSource<K>, target: &WatchTarget, cfg: &WatchConfig, mut predicate: P) -> Result<K>
where
    K: kube::Resource + Send + 'static,
    P: FnMut(EventKind, &K) -> bool + Send,
{
    let handle = source.open(target).await.with_context(|| format!("opening watch on {} for {} \"{}\"", target.api_path, target.kind, target.name))?;
    wait_on(handle, target, cfg.timeout, move |item| match item {
        WatchItem::Event(ev) if predicate(ev.kind, &ev.object) => Some(ev.object),
        _ => None,
    })
    .await
}

/// Resolve once `target` is gone: a `deleted` event, or a listing without it.
pub async fn wait_for_deletion<K>(source: &dyn WatchSource<K>, target: &WatchTarget, cfg: &WatchConfig) -> Result<()>
where
    K: kube::Resource + Send + 'static,
{
    let handle = source.open(target).await.with_context(|| format!("opening watch on {} for {} \"{}\"", target.api_path, target.kind, target.name))?;
    wait_on(handle, target, cfg.timeout, |item| match item {
        WatchItem::Absent => Some(()),
        WatchItem::Event(ev) if ev.kind == EventKind::Deleted => Some(()),
        WatchItem::Event(_) => None,
    })
    .await
}

async fn wait_on<K, R, F>(handle: WatchHandle<K>, target: &WatchTarget, timeout: Duration, mut accept: F) -> Result<R>
where
    K: kube::Resource + Send + 'static,
    R: Send,
    F: FnMut(WatchItem<K>) -> Option<R> + Send,
{
    let WatchHandle { mut events, guard } = handle;
    let _guard = guard;
    let waited = tokio::time::timeout(timeout, async {
        while let Some(item) = events.next().await {
            let item = item.with_context(|| format!("watch error on {} for {} \"{}\"", target.api_path, target.kind, target.name))?;
            if let WatchItem::Event(ev) = &item {
                if !target.matches(&ev.object) {
                    continue;
                }
                debug!(kind = %target.kind, name = %target.name, event = ?ev.kind, "watch event");
            }
            if let Some(out) = accept(item) {
                return Ok(out);
            }
        }
        Err(anyhow!("watch on {} ended before {} \"{}\" met the condition", target.api_path, target.kind, target.name))
    })
    .await;
    match waited {
        Ok(res) => res,
        Err(_) => {
            counter!("k8test_watch_timeouts_total", 1u64);
            info!(kind = %target.kind, name = %target.name, ns = ?target.namespace, timeout_secs = timeout.as_secs(), "watch timed out");
            Err(target.timeout_error(timeout).into())
        }
    }
}
