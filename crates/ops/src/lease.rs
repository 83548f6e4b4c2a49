//! Cross-process lock per subscription scope, held as a coordination Lease.
//!
//! Whoever creates the Lease holds the scope. Everyone else polls until it is
//! released, or until its duration has run out and it may be broken.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{DateTime, TimeDelta, Utc};
use k8test_core::{is_already_exists, is_not_found, ResourceError};
use k8test_kubehub::ResourceApi;
use kube::ResourceExt;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manifests;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a holder may keep a scope before others break the lock.
    /// Must outlast two watch timeouts (teardown deletes a pair under the lock).
    pub duration: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { duration: Duration::from_secs(150), retry_interval: Duration::from_millis(250) }
    }
}

impl LeaseConfig {
    /// Reads `K8TEST_LEASE_SECS` and `K8TEST_LEASE_RETRY_MS`.
    pub fn from_env() -> Self {
        let secs = std::env::var("K8TEST_LEASE_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(150);
        let retry = std::env::var("K8TEST_LEASE_RETRY_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(250);
        Self { duration: Duration::from_secs(secs), retry_interval: Duration::from_millis(retry) }
    }
}

/// Lease guarding the Service/Deployment pair called `resource_name`.
pub fn lock_name(resource_name: &str) -> String {
    format!("{}-lock", resource_name)
}

/// A held scope lock. Release it with [`ScopeLease::release`]; if it is dropped
/// instead, the Lease is deleted in the background.
pub struct ScopeLease {
    api: Option<Arc<dyn ResourceApi<Lease>>>,
    name: String,
    resource_version: String,
}

impl ScopeLease {
    pub async fn acquire(
        api: Arc<dyn ResourceApi<Lease>>,
        namespace: &str,
        name: &str,
        holder: &str,
        config: &LeaseConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let started = Instant::now();
        let lease = manifests::scope_lease(name, namespace, holder, config.duration);
        let mut waits: u64 = 0;
        loop {
            match api.create(&lease).await {
                Ok(created) => {
                    histogram!("k8test_scope_lock_wait_seconds", started.elapsed().as_secs_f64());
                    debug!(lease = %name, ns = %namespace, holder, waits, "scope locked");
                    let resource_version = created.resource_version().unwrap_or_default();
                    return Ok(Self { api: Some(api), name: name.to_string(), resource_version });
                }
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e),
            }
            match api.get(name).await {
                Ok(current) if is_expired(&current, Utc::now()) => {
                    if let Some(rv) = current.resource_version() {
                        let stale = current.spec.as_ref().and_then(|s| s.holder_identity.clone()).unwrap_or_default();
                        warn!(lease = %name, ns = %namespace, stale_holder = %stale, "breaking expired scope lock");
                        counter!("k8test_scope_locks_broken_total", 1u64);
                        api.delete_if_unchanged(name, &rv).await?;
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
            waits += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResourceError::Cancelled(format!("waiting for scope lock {}", name)).into()),
                _ = tokio::time::sleep(config.retry_interval) => {}
            }
        }
    }

    pub async fn release(mut self) {
        if let Some(api) = self.api.take() {
            release(api.as_ref(), &self.name, &self.resource_version).await;
        }
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        let Some(api) = self.api.take() else { return };
        let name = std::mem::take(&mut self.name);
        let resource_version = std::mem::take(&mut self.resource_version);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(api.as_ref(), &name, &resource_version).await });
            }
            Err(_) => warn!(lease = %name, "no runtime to release scope lock; it expires on its own"),
        }
    }
}

async fn release(api: &dyn ResourceApi<Lease>, name: &str, resource_version: &str) {
    match api.delete_if_unchanged(name, resource_version).await {
        Ok(true) => debug!(lease = %name, "scope unlocked"),
        Ok(false) => warn!(lease = %name, "scope lock was broken while held"),
        Err(e) => warn!(lease = %name, error = %e, "releasing scope lock failed; it expires on its own"),
    }
}

/// A Lease without a start time or duration counts as expired.
fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else { return true };
    let Some(MicroTime(since)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else { return true };
    let ttl = TimeDelta::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    since.checked_add_signed(ttl).map_or(true, |until| until < now)
}
