//! Object builders for the resources k8test manages.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, MicroTime, ObjectMeta};
use k8s_openapi::chrono::Utc;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8test_core::labels::MANAGED;
use k8test_core::{subscription_label, Labels, ResourceNaming, SubscriptionOp};
use serde::{Deserialize, Serialize};

/// Extra container settings passed through to the pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerOptions {
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub image_pull_policy: Option<String>,
}

fn meta(name: &str, namespace: Option<&str>, labels: Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn managed_labels() -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED.to_string(), "true".to_string());
    labels
}

/// NodePort service selecting the pods of the deployment with the same identity labels.
pub fn service(naming: &ResourceNaming, namespace: &str, labels: &Labels, container_port: i32) -> Service {
    Service {
        metadata: meta(&naming.resource_name, Some(namespace), labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(labels.clone()),
            ports: Some(vec![ServicePort {
                name: Some("main".to_string()),
                protocol: Some("TCP".to_string()),
                port: container_port,
                target_port: Some(IntOrString::Int(container_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Single-replica deployment. The object carries the creator's `subscribe` label;
/// the pod template only carries identity labels.
pub fn deployment(naming: &ResourceNaming, namespace: &str, labels: &Labels, image_url: &str, container_port: i32, options: &ContainerOptions) -> Deployment {
    let mut object_labels = labels.clone();
    let (key, value) = subscription_label(SubscriptionOp::Subscribe);
    object_labels.insert(key, value);

    let env: Vec<EnvVar> = options.env.iter().map(|(name, value)| EnvVar { name: name.clone(), value: Some(value.clone()), ..Default::default() }).collect();
    let container = Container {
        name: naming.resource_name.clone(),
        image: Some(image_url.to_string()),
        image_pull_policy: options.image_pull_policy.clone(),
        ports: Some(vec![ContainerPort { container_port, protocol: Some("TCP".to_string()), ..Default::default() }]),
        env: (!env.is_empty()).then_some(env),
        command: (!options.command.is_empty()).then(|| options.command.clone()),
        args: (!options.args.is_empty()).then(|| options.args.clone()),
        ..Default::default()
    };
    Deployment {
        metadata: meta(&naming.resource_name, Some(namespace), object_labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn namespace(name: &str) -> Namespace {
    Namespace { metadata: meta(name, None, managed_labels()), ..Default::default() }
}

pub const ADMIN_ROLE_NAME: &str = "k8test-admin";

/// All verbs on all resources of the namespace.
pub fn admin_role(namespace: &str) -> Role {
    Role {
        metadata: meta(ADMIN_ROLE_NAME, Some(namespace), managed_labels()),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn admin_role_binding(name: &str, namespace: &str, service_account: &str) -> RoleBinding {
    RoleBinding {
        metadata: meta(name, Some(namespace), managed_labels()),
        role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".to_string(), kind: "Role".to_string(), name: ADMIN_ROLE_NAME.to_string() },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Scope lock taken by `holder`, acquired now.
pub fn scope_lease(name: &str, namespace: &str, holder: &str, duration: Duration) -> Lease {
    Lease {
        metadata: meta(name, Some(namespace), managed_labels()),
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)),
            acquire_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8test_core::{generate_resource_name, identity_labels, subscription_balance, ResourceIdentity, SingletonStrategy};

    #[test]
    fn service_selects_deployment_pods() {
        let id = ResourceIdentity::new("app", "redis", "ns", SingletonStrategy::AppId);
        let naming = generate_resource_name(&id);
        let labels = identity_labels(&id, &naming);
        let svc = service(&naming, "ns", &labels, 6379);
        let dep = deployment(&naming, "ns", &labels, "redis:7", 6379, &ContainerOptions::default());

        let selector = svc.spec.as_ref().and_then(|s| s.selector.clone()).expect("selector");
        let template = dep.spec.as_ref().and_then(|s| s.template.metadata.as_ref()).and_then(|m| m.labels.clone()).expect("template labels");
        assert_eq!(selector, template);
        assert_eq!(svc.metadata.name, dep.metadata.name);
        assert_eq!(subscription_balance(dep.metadata.labels.as_ref().expect("labels")), 1);
        assert_eq!(subscription_balance(&template), 0);
    }

    #[test]
    fn container_options_flow_into_pod_spec() {
        let id = ResourceIdentity::new("app", "redis", "ns", SingletonStrategy::AppId);
        let naming = generate_resource_name(&id);
        let mut options = ContainerOptions { args: vec!["--appendonly".into(), "yes".into()], ..Default::default() };
        options.env.insert("MODE".into(), "test".into());
        let dep = deployment(&naming, "ns", &Labels::new(), "redis:7", 6379, &options);
        let pod = dep.spec.and_then(|s| s.template.spec).expect("pod spec");
        let c = &pod.containers[0];
        assert_eq!(c.image.as_deref(), Some("redis:7"));
        assert_eq!(c.args.as_ref().map(Vec::len), Some(2));
        assert!(c.command.is_none());
        assert_eq!(c.env.as_ref().expect("env")[0].name, "MODE");
    }
}
