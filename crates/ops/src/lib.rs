//! k8test ops: the create-or-adopt reconciler, the label-encoded subscription
//! counter, the Lease-based scope lock and the image orchestrator built on them.
//!
//! All cluster access goes through [`k8test_kubehub::ClusterApis`], so every
//! operation here runs unchanged against a real cluster or the in-memory one.

#![forbid(unsafe_code)]

mod lease;
pub mod manifests;
mod namespace;
mod orchestrator;
mod reconcile;
mod subscription;

pub use lease::{lock_name, LeaseConfig, ScopeLease};
pub use manifests::ContainerOptions;
pub use namespace::{delete_namespace, ensure_namespace, grant_admin_role};
pub use orchestrator::{
    tcp_readiness, Orchestrator, OrchestratorConfig, ReadinessCheck, SubscribeRequest, UnsubscribeRequest, Unsubscribed,
};
pub use reconcile::{claim, create_or_adopt, Adoption, Reconciled};
pub use subscription::add_subscription_label;
