//! k8test core types: singleton strategies, deterministic resource naming,
//! the identifying label scheme and the subscription balance.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod error;
pub mod labels;
pub mod naming;

pub use error::{is_already_exists, is_not_found, ResourceError};
pub use labels::{
    identity_labels, subscription_balance, subscription_label, Labels, SubscriptionOp,
};
pub use naming::{generate_resource_name, ResourceNaming};

pub mod prelude {
    pub use super::{
        generate_resource_name, identity_labels, subscription_balance, DeployedImage,
        ExposeStrategy, Labels, ResourceError, ResourceIdentity, ResourceNaming,
        SingletonStrategy, SubscriptionOp,
    };
}

/// How aggressively a backing resource is shared between subscribe calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SingletonStrategy {
    /// Always a fresh resource; scope mixes a random id with the app id.
    #[serde(rename = "many")]
    Many,
    /// One resource per app id.
    #[serde(rename = "appId")]
    AppId,
    /// One resource per namespace (and app id); never torn down by a single unsubscribe.
    #[serde(rename = "namespace")]
    Namespace,
}

impl SingletonStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SingletonStrategy::Many => "many",
            SingletonStrategy::AppId => "appId",
            SingletonStrategy::Namespace => "namespace",
        }
    }

    /// Strategies whose resources are reference counted and deleted at balance 0.
    pub fn is_reference_counted(&self) -> bool {
        !matches!(self, SingletonStrategy::Namespace)
    }
}

impl std::fmt::Display for SingletonStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SingletonStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "many" => Ok(SingletonStrategy::Many),
            "appId" | "app-id" => Ok(SingletonStrategy::AppId),
            "namespace" => Ok(SingletonStrategy::Namespace),
            other => Err(format!("unknown singleton strategy: {} (expect many|appId|namespace)", other)),
        }
    }
}

/// Where the caller of subscribe will connect from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExposeStrategy {
    /// Master node internal IP + service NodePort.
    #[serde(rename = "userMachine")]
    UserMachine,
    /// Service ClusterIP + service port.
    #[serde(rename = "insideCluster")]
    InsideCluster,
}

/// Everything that decides which backing resource a subscribe call lands on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    pub app_id: String,
    pub image_name: String,
    pub namespace_name: String,
    pub singleton_strategy: SingletonStrategy,
}

impl ResourceIdentity {
    pub fn new(app_id: impl Into<String>, image_name: impl Into<String>, namespace_name: impl Into<String>, singleton_strategy: SingletonStrategy) -> Self {
        Self {
            app_id: app_id.into(),
            image_name: image_name.into(),
            namespace_name: namespace_name.into(),
            singleton_strategy,
        }
    }
}

/// Connection info for a subscribed image. Derived from cluster state on every call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployedImage {
    pub deployment_name: String,
    pub service_name: String,
    pub deployed_image_url: String,
    pub deployed_image_address: String,
    pub deployed_image_port: i32,
}
