//! k8test kubehub: the seam between k8test and the Kubernetes API.
//!
//! Everything above this crate talks to the cluster through [`ResourceApi`],
//! [`ClusterNodes`] and [`ClusterApis`]; the kube-rs backed implementations live
//! here next to an in-memory cluster used by tests.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

mod cluster;
pub mod memory;
mod nodes;
pub mod ready;
mod resource;
pub mod watch;

pub use cluster::{ClusterApis, KubeCluster};
pub use nodes::{ClusterNodes, KubeNodes, StaticNodes, CONTROL_PLANE_ROLE_LABEL, MASTER_ROLE_LABEL};
pub use ready::{tcp_probe, wait_until_ready};
pub use resource::{KubeResourceApi, Readiness, ResourceApi};
pub use watch::{wait_for_deletion, wait_for_resource, EventKind, ResourceEvent, WatchConfig, WatchHandle, WatchItem, WatchSource, WatchTarget};

/// Build a client from kubeconfig or the in-cluster environment. Not cached: one handle per call site.
pub async fn kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster env)")
}
