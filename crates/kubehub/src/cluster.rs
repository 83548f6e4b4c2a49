use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::Client;

use crate::nodes::{ClusterNodes, KubeNodes};
use crate::resource::{KubeResourceApi, ResourceApi};
use crate::watch::WatchConfig;

/// Hands out per-kind, per-namespace resource APIs.
pub trait ClusterApis: Send + Sync {
    fn namespaces(&self) -> Arc<dyn ResourceApi<Namespace>>;
    fn services(&self, namespace: &str) -> Arc<dyn ResourceApi<Service>>;
    fn deployments(&self, namespace: &str) -> Arc<dyn ResourceApi<Deployment>>;
    fn roles(&self, namespace: &str) -> Arc<dyn ResourceApi<Role>>;
    fn role_bindings(&self, namespace: &str) -> Arc<dyn ResourceApi<RoleBinding>>;
    /// Scope locks shared by every process talking to the cluster.
    fn leases(&self, namespace: &str) -> Arc<dyn ResourceApi<Lease>>;
    fn nodes(&self) -> Arc<dyn ClusterNodes>;
}

/// Real cluster behind one client handle.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    watch: WatchConfig,
}

impl KubeCluster {
    pub fn new(client: Client, watch: WatchConfig) -> Self {
        Self { client, watch }
    }

    pub async fn connect(watch: WatchConfig) -> Result<Self> {
        Ok(Self::new(crate::kube_client().await?, watch))
    }
}

impl ClusterApis for KubeCluster {
    fn namespaces(&self) -> Arc<dyn ResourceApi<Namespace>> {
        Arc::new(KubeResourceApi::<Namespace>::cluster(self.client.clone(), self.watch.clone()))
    }

    fn services(&self, namespace: &str) -> Arc<dyn ResourceApi<Service>> {
        Arc::new(KubeResourceApi::<Service>::namespaced(self.client.clone(), namespace, self.watch.clone()))
    }

    fn deployments(&self, namespace: &str) -> Arc<dyn ResourceApi<Deployment>> {
        Arc::new(KubeResourceApi::<Deployment>::namespaced(self.client.clone(), namespace, self.watch.clone()))
    }

    fn roles(&self, namespace: &str) -> Arc<dyn ResourceApi<Role>> {
        Arc::new(KubeResourceApi::<Role>::namespaced(self.client.clone(), namespace, self.watch.clone()))
    }

    fn role_bindings(&self, namespace: &str) -> Arc<dyn ResourceApi<RoleBinding>> {
        Arc::new(KubeResourceApi::<RoleBinding>::namespaced(self.client.clone(), namespace, self.watch.clone()))
    }

    fn leases(&self, namespace: &str) -> Arc<dyn ResourceApi<Lease>> {
        Arc::new(KubeResourceApi::<Lease>::namespaced(self.client.clone(), namespace, self.watch.clone()))
    }

    fn nodes(&self) -> Arc<dyn ClusterNodes> {
        Arc::new(KubeNodes::new(self.client.clone()))
    }
}
