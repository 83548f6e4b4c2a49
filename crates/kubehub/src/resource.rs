use std::collections::HashSet;
use std::fmt::Debug;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use k8test_core::{Labels, ResourceError};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions},
    runtime::watcher::{self, Event},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::watch::{self as w, EventKind, ResourceEvent, WatchConfig, WatchHandle, WatchItem, WatchSource, WatchTarget};

/// Kind-specific "is this object usable yet" check, evaluated on watch events.
pub trait Readiness {
    fn is_ready(event: EventKind, obj: &Self) -> bool;
}

impl Readiness for Deployment {
    /// Every desired replica is ready and available.
    fn is_ready(event: EventKind, obj: &Self) -> bool {
        if event == EventKind::Deleted {
            return false;
        }
        let desired = obj.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        match obj.status.as_ref() {
            Some(st) => {
                let ready = st.ready_replicas.unwrap_or(0);
                ready == st.available_replicas.unwrap_or(0) && ready == st.replicas.unwrap_or(0) && ready == desired
            }
            None => false,
        }
    }
}

macro_rules! ready_when_added {
    ($($t:ty),*) => {
        $(impl Readiness for $t {
            fn is_ready(event: EventKind, _obj: &Self) -> bool { event == EventKind::Added }
        })*
    };
}

ready_when_added!(Service, Namespace, Role, RoleBinding, Lease);

/// The operations k8test performs on one resource kind in one namespace (or cluster-wide).
#[async_trait::async_trait]
pub trait ResourceApi<K>: Send + Sync {
    fn kind(&self) -> &str;

    /// Create; a name conflict surfaces as [`ResourceError::AlreadyExists`].
    async fn create(&self, obj: &K) -> Result<K>;

    /// Fetch; absence surfaces as [`ResourceError::NotFound`].
    async fn get(&self, name: &str) -> Result<K>;

    /// Strategic-merge the given labels into `metadata.labels`; returns the server's view.
    async fn merge_labels(&self, name: &str, labels: &Labels) -> Result<K>;

    /// Block until the object is observably ready (bounded by the watch timeout).
    async fn wait_until_ready(&self, name: &str) -> Result<K>;

    /// Delete and block until the object is gone. Deleting a missing object succeeds.
    async fn delete_and_wait(&self, name: &str) -> Result<()>;

    /// Delete only while the object still carries `resource_version`, without
    /// waiting. `false` when it changed in between or is already gone.
    async fn delete_if_unchanged(&self, name: &str, resource_version: &str) -> Result<bool>;
}

/// kube-rs backed [`ResourceApi`], also a [`WatchSource`].
pub struct KubeResourceApi<K> {
    api: Api<K>,
    namespace: Option<String>,
    kind: String,
    api_path: String,
    watch: WatchConfig,
}

impl<K> KubeResourceApi<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn namespaced(client: Client, namespace: &str, watch: WatchConfig) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: Some(namespace.to_string()),
            kind: K::kind(&()).to_string(),
            api_path: K::url_path(&(), Some(namespace)),
            watch,
        }
    }

    pub fn cluster(client: Client, watch: WatchConfig) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
    {
        Self { api: Api::all(client), namespace: None, kind: K::kind(&()).to_string(), api_path: K::url_path(&(), None), watch }
    }

    fn target(&self, name: &str) -> WatchTarget {
        WatchTarget { api_path: self.api_path.clone(), kind: self.kind.clone(), namespace: self.namespace.clone(), name: name.to_string() }
    }

    fn classify(&self, err: kube::Error, name: &str, action: &str) -> anyhow::Error {
        classify_error(&self.kind, self.namespace.as_deref(), err, name, action)
    }
}

/// Map API status codes onto [`ResourceError`] so callers can branch on conflicts.
fn classify_error(kind: &str, namespace: Option<&str>, err: kube::Error, name: &str, action: &str) -> anyhow::Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ResourceError::AlreadyExists { kind: kind.to_string(), name: name.to_string() }.into()
        }
        kube::Error::Api(ae) if ae.code == 404 => ResourceError::NotFound { kind: kind.to_string(), name: name.to_string() }.into(),
        _ => anyhow::Error::new(err).context(format!("{} {} \"{}\" (ns: {})", action, kind, name, namespace.unwrap_or("-"))),
    }
}

/// One watcher event as watch items. `seen` carries the names reported so far
/// across calls, so a re-applied object reads as a modification.
fn watch_items<K: Resource>(seen: &mut HashSet<String>, wanted: &str, ev: Result<Event<K>, watcher::Error>) -> Vec<Result<WatchItem<K>>> {
    match ev {
        Ok(Event::Applied(o)) => {
            let kind = if seen.insert(o.name_any()) { EventKind::Added } else { EventKind::Modified };
            vec![Ok(WatchItem::Event(ResourceEvent { kind, object: o }))]
        }
        Ok(Event::Deleted(o)) => {
            seen.remove(&o.name_any());
            vec![Ok(WatchItem::Event(ResourceEvent { kind: EventKind::Deleted, object: o }))]
        }
        Ok(Event::Restarted(list)) => {
            seen.clear();
            if !list.iter().any(|o| o.name_any() == wanted) {
                return vec![Ok(WatchItem::Absent)];
            }
            list.into_iter()
                .map(|o| {
                    seen.insert(o.name_any());
                    Ok(WatchItem::Event(ResourceEvent { kind: EventKind::Added, object: o }))
                })
                .collect()
        }
        Err(e) => vec![Err(anyhow!(e))],
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K> for KubeResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn open(&self, target: &WatchTarget) -> Result<WatchHandle<K>> {
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", target.name));
        let (stream, abort) = futures::stream::abortable(watcher::watcher(self.api.clone(), cfg));
        let wanted = target.name.clone();
        let mut seen: HashSet<String> = HashSet::new();
        let events = stream
            .map(move |ev| watch_items(&mut seen, &wanted, ev))
            .flat_map(futures::stream::iter)
            .boxed();
        let path = target.api_path.clone();
        Ok(WatchHandle::new(events, move || {
            debug!(api = %path, "watch aborted");
            abort.abort();
        }))
    }
}

#[async_trait::async_trait]
impl<K> ResourceApi<K> for KubeResourceApi<K>
where
    K: Resource<DynamicType = ()> + Readiness + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let created = self.api.create(&PostParams::default(), obj).await.map_err(|e| self.classify(e, &name, "creating"))?;
        info!(kind = %self.kind, name = %name, ns = ?self.namespace, "created");
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<K> {
        self.api.get(name).await.map_err(|e| self.classify(e, name, "reading"))
    }

    async fn merge_labels(&self, name: &str, labels: &Labels) -> Result<K> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| self.classify(e, name, "patching labels of"))
    }

    async fn wait_until_ready(&self, name: &str) -> Result<K> {
        w::wait_for_resource(self, &self.target(name), &self.watch, |event, obj: &K| K::is_ready(event, obj)).await
    }

    async fn delete_and_wait(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = %self.kind, name = %name, "already gone");
                return Ok(());
            }
            Err(e) => return Err(self.classify(e, name, "deleting")),
        }
        w::wait_for_deletion(self, &self.target(name), &self.watch).await?;
        info!(kind = %self.kind, name = %name, ns = ?self.namespace, "deleted");
        Ok(())
    }

    async fn delete_if_unchanged(&self, name: &str, resource_version: &str) -> Result<bool> {
        let dp = DeleteParams {
            preconditions: Some(Preconditions { resource_version: Some(resource_version.to_string()), uid: None }),
            ..Default::default()
        };
        match self.api.delete(name, &dp).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => {
                debug!(kind = %self.kind, name = %name, reason = %ae.reason, "not deleted; changed or gone");
                Ok(false)
            }
            Err(e) => Err(self.classify(e, name, "deleting")),
        }
    }
}
