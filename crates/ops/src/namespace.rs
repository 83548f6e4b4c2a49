use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use k8test_core::naming::dns_label;
use k8test_kubehub::ClusterApis;
use tracing::info;

use crate::manifests;
use crate::reconcile::{create_or_adopt, Adoption, Reconciled};

/// Create the namespace, or adopt it if it already exists (whatever its labels).
pub async fn ensure_namespace(cluster: &dyn ClusterApis, name: &str) -> Result<Reconciled<Namespace>> {
    let ns = create_or_adopt(cluster.namespaces().as_ref(), &manifests::namespace(name), Adoption::Any)
        .await
        .with_context(|| format!("ensuring namespace {}", name))?;
    info!(ns = %name, new = ns.is_new_resource, "namespace ready");
    Ok(ns)
}

/// Delete the namespace and wait until the API server reports it gone.
pub async fn delete_namespace(cluster: &dyn ClusterApis, name: &str) -> Result<()> {
    cluster.namespaces().delete_and_wait(name).await.with_context(|| format!("deleting namespace {}", name))?;
    info!(ns = %name, "namespace deleted");
    Ok(())
}

/// Give `service_account` every verb on every resource in `namespace`.
/// Returns the role binding name.
pub async fn grant_admin_role(cluster: &dyn ClusterApis, namespace: &str, service_account: &str) -> Result<String> {
    create_or_adopt(cluster.roles(namespace).as_ref(), &manifests::admin_role(namespace), Adoption::Any)
        .await
        .with_context(|| format!("ensuring admin role in {}", namespace))?;
    let binding = dns_label(&format!("{}-{}", manifests::ADMIN_ROLE_NAME, service_account));
    create_or_adopt(cluster.role_bindings(namespace).as_ref(), &manifests::admin_role_binding(&binding, namespace, service_account), Adoption::Any)
        .await
        .with_context(|| format!("binding admin role to {} in {}", service_account, namespace))?;
    info!(ns = %namespace, service_account = %service_account, binding = %binding, "admin role granted");
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8test_kubehub::memory::MemoryCluster;

    #[tokio::test]
    async fn ensure_namespace_is_idempotent() {
        let cluster = MemoryCluster::new("10.0.0.1");
        assert!(ensure_namespace(&cluster, "t1").await.expect("create").is_new_resource);
        assert!(!ensure_namespace(&cluster, "t1").await.expect("adopt").is_new_resource);
        delete_namespace(&cluster, "t1").await.expect("delete");
        assert!(cluster.memory_namespaces().names().is_empty());
        delete_namespace(&cluster, "t1").await.expect("deleting a missing namespace succeeds");
    }

    #[tokio::test]
    async fn admin_grant_binds_service_account() {
        let cluster = MemoryCluster::new("10.0.0.1");
        let binding = grant_admin_role(&cluster, "t1", "default").await.expect("grant");
        assert_eq!(binding, "k8test-admin-default");
        grant_admin_role(&cluster, "t1", "default").await.expect("second grant adopts");
        let rb = cluster.memory_role_bindings("t1").snapshot(&binding).expect("binding");
        assert_eq!(rb.role_ref.name, manifests::ADMIN_ROLE_NAME);
        assert_eq!(rb.subjects.expect("subjects")[0].name, "default");
        assert_eq!(cluster.memory_roles("t1").created_count(), 1);
    }
}
