use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use tracing::debug;

pub const MASTER_ROLE_LABEL: &str = "node-role.kubernetes.io/master";
pub const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Where a user machine can reach NodePort services.
#[async_trait::async_trait]
pub trait ClusterNodes: Send + Sync {
    async fn master_internal_ip(&self) -> Result<String>;
}

pub struct KubeNodes {
    api: Api<Node>,
}

impl KubeNodes {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

#[async_trait::async_trait]
impl ClusterNodes for KubeNodes {
    async fn master_internal_ip(&self) -> Result<String> {
        for selector in [MASTER_ROLE_LABEL, CONTROL_PLANE_ROLE_LABEL] {
            let nodes = self.api.list(&ListParams::default().labels(selector)).await.with_context(|| format!("listing nodes labelled {}", selector))?;
            for node in nodes.items.iter() {
                if let Some(ip) = internal_ip(node) {
                    debug!(node = %node.name_any(), ip = %ip, "master node address");
                    return Ok(ip);
                }
            }
        }
        Err(anyhow!("no node labelled {} or {} reports an InternalIP address", MASTER_ROLE_LABEL, CONTROL_PLANE_ROLE_LABEL))
    }
}

/// Fixed address; for tests and for clusters reached through a known gateway.
pub struct StaticNodes(pub String);

#[async_trait::async_trait]
impl ClusterNodes for StaticNodes {
    async fn master_internal_ip(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
