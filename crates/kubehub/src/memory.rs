//! In-memory cluster for tests. Create is atomic per object name, so concurrent
//! creators race exactly like they do against the API server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8test_core::{Labels, ResourceError};
use kube::{Resource, ResourceExt};

use crate::cluster::ClusterApis;
use crate::nodes::{ClusterNodes, StaticNodes};
use crate::resource::ResourceApi;

type CreateHook<K> = Box<dyn Fn(&mut K) + Send + Sync>;

pub struct MemoryResourceApi<K> {
    kind: String,
    objects: Mutex<BTreeMap<String, K>>,
    on_create: Option<CreateHook<K>>,
    ready_delay: Option<Duration>,
    revision: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl<K> MemoryResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            objects: Mutex::new(BTreeMap::new()),
            on_create: None,
            ready_delay: None,
            revision: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Mutate objects as they are created (e.g. assign a ClusterIP).
    pub fn with_create_hook(mut self, hook: impl Fn(&mut K) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Box::new(hook));
        self
    }

    /// Stand-in for the watch round-trip: `wait_until_ready` sleeps this long first.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = Some(delay);
        self
    }

    /// Seed an object, bypassing conflict checks.
    pub fn insert(&self, obj: K) {
        self.lock().insert(obj.name_any(), obj);
    }

    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn created_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deleted_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, K>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_revision(&self) -> Option<String> {
        Some((self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn not_found(&self, name: &str) -> anyhow::Error {
        ResourceError::NotFound { kind: self.kind.clone(), name: name.to_string() }.into()
    }
}

impl<K> Default for MemoryResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<K> ResourceApi<K> for MemoryResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn create(&self, obj: &K) -> Result<K> {
        tokio::task::yield_now().await;
        let name = obj.name_any();
        let mut objects = self.lock();
        if objects.contains_key(&name) {
            return Err(ResourceError::AlreadyExists { kind: self.kind.clone(), name }.into());
        }
        let mut stored = obj.clone();
        if let Some(hook) = &self.on_create {
            hook(&mut stored);
        }
        stored.meta_mut().resource_version = self.next_revision();
        objects.insert(name, stored.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn get(&self, name: &str) -> Result<K> {
        tokio::task::yield_now().await;
        self.lock().get(name).cloned().ok_or_else(|| self.not_found(name))
    }

    async fn merge_labels(&self, name: &str, labels: &Labels) -> Result<K> {
        tokio::task::yield_now().await;
        let mut objects = self.lock();
        let obj = objects.get_mut(name).ok_or_else(|| self.not_found(name))?;
        obj.labels_mut().extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        obj.meta_mut().resource_version = self.next_revision();
        Ok(obj.clone())
    }

    async fn wait_until_ready(&self, name: &str) -> Result<K> {
        if let Some(delay) = self.ready_delay {
            tokio::time::sleep(delay).await;
        }
        self.get(name).await
    }

    async fn delete_and_wait(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        if self.lock().remove(name).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn delete_if_unchanged(&self, name: &str, resource_version: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut objects = self.lock();
        let current = objects.get(name).and_then(|o| o.meta().resource_version.clone());
        if current.as_deref() != Some(resource_version) {
            return Ok(false);
        }
        objects.remove(name);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Per-namespace registry of in-memory resource APIs.
pub struct MemoryCluster {
    namespaces: Arc<MemoryResourceApi<Namespace>>,
    services: Mutex<HashMap<String, Arc<MemoryResourceApi<Service>>>>,
    deployments: Mutex<HashMap<String, Arc<MemoryResourceApi<Deployment>>>>,
    roles: Mutex<HashMap<String, Arc<MemoryResourceApi<Role>>>>,
    role_bindings: Mutex<HashMap<String, Arc<MemoryResourceApi<RoleBinding>>>>,
    leases: Mutex<HashMap<String, Arc<MemoryResourceApi<Lease>>>>,
    master_ip: String,
    next_port: Arc<AtomicUsize>,
    ready_delay: Option<Duration>,
}

impl MemoryCluster {
    pub fn new(master_ip: impl Into<String>) -> Self {
        Self {
            namespaces: Arc::new(MemoryResourceApi::new()),
            services: Mutex::new(HashMap::new()),
            deployments: Mutex::new(HashMap::new()),
            roles: Mutex::new(HashMap::new()),
            role_bindings: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            master_ip: master_ip.into(),
            next_port: Arc::new(AtomicUsize::new(0)),
            ready_delay: None,
        }
    }

    /// Every kind waits `delay` in `wait_until_ready`, so callers overlap the
    /// way they do while a real watch is pending.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = Some(delay);
        self.namespaces = Arc::new(self.api());
        self
    }

    fn api<K>(&self) -> MemoryResourceApi<K>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        match self.ready_delay {
            Some(delay) => MemoryResourceApi::new().with_ready_delay(delay),
            None => MemoryResourceApi::new(),
        }
    }

    pub fn memory_namespaces(&self) -> Arc<MemoryResourceApi<Namespace>> {
        Arc::clone(&self.namespaces)
    }

    /// Services get a ClusterIP and NodePorts assigned on create.
    pub fn memory_services(&self, namespace: &str) -> Arc<MemoryResourceApi<Service>> {
        let next = Arc::clone(&self.next_port);
        entry(&self.services, namespace, move || {
            self.api().with_create_hook(move |svc: &mut Service| {
                let n = next.fetch_add(1, Ordering::SeqCst);
                if let Some(spec) = svc.spec.as_mut() {
                    spec.cluster_ip = Some(format!("10.96.0.{}", n + 10));
                    for port in spec.ports.iter_mut().flatten() {
                        port.node_port = Some(30000 + n as i32);
                    }
                }
            })
        })
    }

    pub fn memory_deployments(&self, namespace: &str) -> Arc<MemoryResourceApi<Deployment>> {
        entry(&self.deployments, namespace, || self.api())
    }

    pub fn memory_roles(&self, namespace: &str) -> Arc<MemoryResourceApi<Role>> {
        entry(&self.roles, namespace, || self.api())
    }

    pub fn memory_role_bindings(&self, namespace: &str) -> Arc<MemoryResourceApi<RoleBinding>> {
        entry(&self.role_bindings, namespace, || self.api())
    }

    pub fn memory_leases(&self, namespace: &str) -> Arc<MemoryResourceApi<Lease>> {
        entry(&self.leases, namespace, || self.api())
    }
}

fn entry<T>(map: &Mutex<HashMap<String, Arc<T>>>, namespace: &str, make: impl FnOnce() -> T) -> Arc<T> {
    let mut map = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(map.entry(namespace.to_string()).or_insert_with(|| Arc::new(make())))
}

impl ClusterApis for MemoryCluster {
    fn namespaces(&self) -> Arc<dyn ResourceApi<Namespace>> {
        self.memory_namespaces()
    }

    fn services(&self, namespace: &str) -> Arc<dyn ResourceApi<Service>> {
        self.memory_services(namespace)
    }

    fn deployments(&self, namespace: &str) -> Arc<dyn ResourceApi<Deployment>> {
        self.memory_deployments(namespace)
    }

    fn roles(&self, namespace: &str) -> Arc<dyn ResourceApi<Role>> {
        self.memory_roles(namespace)
    }

    fn role_bindings(&self, namespace: &str) -> Arc<dyn ResourceApi<RoleBinding>> {
        self.memory_role_bindings(namespace)
    }

    fn leases(&self, namespace: &str) -> Arc<dyn ResourceApi<Lease>> {
        self.memory_leases(namespace)
    }

    fn nodes(&self) -> Arc<dyn ClusterNodes> {
        Arc::new(StaticNodes(self.master_ip.clone()))
    }
}
