//! Subscribe/unsubscribe: a Service plus a Deployment per scope, shared and
//! reference counted according to the singleton strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Service;
use k8test_core::naming::random_id;
use k8test_core::{generate_resource_name, identity_labels, DeployedImage, ExposeStrategy, Labels, ResourceError, ResourceIdentity, ResourceNaming, SubscriptionOp};
use k8test_kubehub::{tcp_probe, ClusterApis, WatchConfig};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::lease::{lock_name, LeaseConfig, ScopeLease};
use crate::manifests::{self, ContainerOptions};
use crate::reconcile::{claim, Adoption};
use crate::subscription::add_subscription_label;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pause after tearing down a Service/Deployment pair.
    pub settle_delay: Duration,
    pub ready_poll_interval: Duration,
    pub watch: WatchConfig,
    pub lease: LeaseConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(3000),
            ready_poll_interval: k8test_kubehub::ready::DEFAULT_POLL_INTERVAL,
            watch: WatchConfig::default(),
            lease: LeaseConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reads `K8TEST_SETTLE_DELAY_MS`, `K8TEST_READY_POLL_MS`, the watch and the lease settings.
    pub fn from_env() -> Self {
        let settle = std::env::var("K8TEST_SETTLE_DELAY_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(3000);
        let poll = std::env::var("K8TEST_READY_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
        Self {
            settle_delay: Duration::from_millis(settle),
            ready_poll_interval: Duration::from_millis(poll),
            watch: WatchConfig::from_env(),
            lease: LeaseConfig::from_env(),
        }
    }
}

/// Probe run against the resolved address until it passes.
pub type ReadinessCheck = Arc<dyn Fn(DeployedImage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Ready once the resolved address accepts TCP connections.
pub fn tcp_readiness() -> ReadinessCheck {
    Arc::new(|image: DeployedImage| -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { tcp_probe(&image.deployed_image_address, image.deployed_image_port).await })
    })
}

pub struct SubscribeRequest {
    pub identity: ResourceIdentity,
    /// Image to run; defaults to `identity.image_name`.
    pub image_url: Option<String>,
    pub container_port: i32,
    pub expose_strategy: ExposeStrategy,
    pub container_options: ContainerOptions,
    pub readiness: Option<ReadinessCheck>,
    pub cancel: CancellationToken,
}

impl SubscribeRequest {
    pub fn new(identity: ResourceIdentity, container_port: i32, expose_strategy: ExposeStrategy) -> Self {
        Self {
            identity,
            image_url: None,
            container_port,
            expose_strategy,
            container_options: ContainerOptions::default(),
            readiness: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub identity: ResourceIdentity,
    pub deployment_name: String,
    pub service_name: String,
}

impl UnsubscribeRequest {
    pub fn for_image(identity: ResourceIdentity, image: &DeployedImage) -> Self {
        Self { identity, deployment_name: image.deployment_name.clone(), service_name: image.service_name.clone() }
    }
}

/// What an unsubscribe did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Unsubscribed {
    /// Namespace-wide singletons outlive every caller.
    Kept,
    /// Other subscribers remain.
    Remaining(i64),
    Deleted,
}

/// One in-flight subscribe/unsubscribe per scope within this process, in
/// front of the cluster-wide Lease. Entries go away with their last user.
#[derive(Default)]
struct ScopeLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct ScopeGuard<'a> {
    locks: &'a ScopeLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl ScopeLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, key: String) -> ScopeGuard<'_> {
        let lock = Arc::clone(self.map().entry(key.clone()).or_default());
        let held = Arc::clone(&lock).lock_owned().await;
        ScopeGuard { locks: self, key, lock, held: Some(held) }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut map = self.locks.map();
        // Only the map and this guard still point at it: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

pub struct Orchestrator {
    cluster: Arc<dyn ClusterApis>,
    config: OrchestratorConfig,
    locks: ScopeLocks,
    /// Lease holder identity of this orchestrator.
    holder: String,
}

impl Orchestrator {
    pub fn new(cluster: Arc<dyn ClusterApis>, config: OrchestratorConfig) -> Self {
        Self { cluster, config, locks: ScopeLocks::default(), holder: format!("k8test-{}", random_id()) }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApis> {
        &self.cluster
    }

    /// Serialize on `ns/name` in this process, then across processes.
    async fn lock_scope(&self, ns: &str, name: &str, cancel: &CancellationToken) -> Result<(ScopeGuard<'_>, ScopeLease)> {
        let local = self.locks.lock(format!("{}/{}", ns, name)).await;
        let lease = ScopeLease::acquire(self.cluster.leases(ns), ns, &lock_name(name), &self.holder, &self.config.lease, cancel).await?;
        Ok((local, lease))
    }

    pub async fn subscribe(&self, req: SubscribeRequest) -> Result<DeployedImage> {
        let started = Instant::now();
        let id = &req.identity;
        let ns = id.namespace_name.as_str();
        let naming = generate_resource_name(id);
        let labels = identity_labels(id, &naming);
        let image_url = req.image_url.clone().unwrap_or_else(|| id.image_name.clone());

        let (local, lease) = self.lock_scope(ns, &naming.resource_name, &req.cancel).await?;
        let claimed = self.claim_pair(&req, &naming, &labels, &image_url).await;
        lease.release().await;
        drop(local);
        let is_new = claimed?;

        let svc = self.cluster.services(ns).wait_until_ready(&naming.resource_name).await?;
        self.cluster.deployments(ns).wait_until_ready(&naming.resource_name).await?;
        let image = self.resolve(&svc, &naming.resource_name, image_url, req.expose_strategy).await?;

        if let Some(check) = &req.readiness {
            let probe = Arc::clone(check);
            let target = image.clone();
            let what = format!("{}:{} ({})", image.deployed_image_address, image.deployed_image_port, naming.resource_name);
            k8test_kubehub::wait_until_ready(&req.cancel, self.config.ready_poll_interval, &what, move || probe(target.clone())).await?;
        }

        counter!("k8test_subscribes_total", 1u64, "strategy" => id.singleton_strategy.as_str());
        histogram!("k8test_subscribe_seconds", started.elapsed().as_secs_f64());
        info!(
            name = %naming.resource_name,
            ns = %ns,
            strategy = %id.singleton_strategy,
            new = is_new,
            address = %image.deployed_image_address,
            port = image.deployed_image_port,
            "subscribed"
        );
        Ok(image)
    }

    /// Create or adopt the Service and the Deployment and record the
    /// subscription. Runs under the scope lock; returns whether the pair is new.
    async fn claim_pair(&self, req: &SubscribeRequest, naming: &ResourceNaming, labels: &Labels, image_url: &str) -> Result<bool> {
        let ns = req.identity.namespace_name.as_str();
        let adoption = Adoption::for_strategy(req.identity.singleton_strategy);
        let services = self.cluster.services(ns);
        let deployments = self.cluster.deployments(ns);
        let svc = claim(services.as_ref(), &manifests::service(naming, ns, labels, req.container_port), adoption).await?;
        let dep = claim(
            deployments.as_ref(),
            &manifests::deployment(naming, ns, labels, image_url, req.container_port, &req.container_options),
            adoption,
        )
        .await?;

        if svc.is_new_resource != dep.is_new_resource {
            let (created, kept) = if svc.is_new_resource { ("Service", "Deployment") } else { ("Deployment", "Service") };
            return Err(ResourceError::InconsistentClusterState(format!(
                "{} \"{}\" was just created but its {} already existed in namespace {}; one of the pair was deleted externally. \
                 Delete namespace {} (or both objects) and retry",
                created, naming.resource_name, kept, ns, ns
            ))
            .into());
        }

        if !dep.is_new_resource {
            add_subscription_label(deployments.as_ref(), &naming.resource_name, SubscriptionOp::Subscribe).await?;
        }
        Ok(dep.is_new_resource)
    }

    async fn resolve(&self, svc: &Service, name: &str, image_url: String, expose: ExposeStrategy) -> Result<DeployedImage> {
        let spec = svc.spec.as_ref().ok_or_else(|| anyhow!("Service \"{}\" has no spec", name))?;
        let port = spec.ports.as_ref().and_then(|p| p.first()).ok_or_else(|| anyhow!("Service \"{}\" exposes no ports", name))?;
        let (address, port) = match expose {
            ExposeStrategy::UserMachine => {
                let ip = self.cluster.nodes().master_internal_ip().await.context("resolving master node address")?;
                let node_port = port.node_port.ok_or_else(|| anyhow!("Service \"{}\" has no NodePort assigned", name))?;
                (ip, node_port)
            }
            ExposeStrategy::InsideCluster => {
                let ip = spec.cluster_ip.clone().ok_or_else(|| anyhow!("Service \"{}\" has no ClusterIP assigned", name))?;
                (ip, port.port)
            }
        };
        Ok(DeployedImage {
            deployment_name: name.to_string(),
            service_name: name.to_string(),
            deployed_image_url: image_url,
            deployed_image_address: address,
            deployed_image_port: port,
        })
    }

    pub async fn unsubscribe(&self, req: &UnsubscribeRequest) -> Result<Unsubscribed> {
        let id = &req.identity;
        let ns = id.namespace_name.as_str();
        if !id.singleton_strategy.is_reference_counted() {
            info!(name = %req.deployment_name, ns = %ns, strategy = %id.singleton_strategy, "namespace singleton kept");
            return Ok(Unsubscribed::Kept);
        }

        let (local, lease) = self.lock_scope(ns, &req.deployment_name, &CancellationToken::new()).await?;
        let outcome = self.release_subscription(req).await;
        lease.release().await;
        drop(local);
        let outcome = outcome?;
        if outcome == Unsubscribed::Deleted {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        Ok(outcome)
    }

    /// Record the unsubscribe and tear the pair down once the balance hits zero. Runs under the scope lock.
    async fn release_subscription(&self, req: &UnsubscribeRequest) -> Result<Unsubscribed> {
        let ns = req.identity.namespace_name.as_str();
        let deployments = self.cluster.deployments(ns);
        let balance = add_subscription_label(deployments.as_ref(), &req.deployment_name, SubscriptionOp::Unsubscribe).await?;
        if balance != 0 {
            if balance < 0 {
                warn!(name = %req.deployment_name, ns = %ns, balance, "more unsubscribes than subscribes; leaving resources in place");
            }
            return Ok(Unsubscribed::Remaining(balance));
        }

        self.cluster.services(ns).delete_and_wait(&req.service_name).await?;
        deployments.delete_and_wait(&req.deployment_name).await?;
        counter!("k8test_teardowns_total", 1u64);
        info!(deployment = %req.deployment_name, service = %req.service_name, ns = %ns, "last subscriber left; deleted");
        Ok(Unsubscribed::Deleted)
    }
}
