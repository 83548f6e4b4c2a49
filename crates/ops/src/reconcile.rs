//! Create-or-adopt: try to create, and on a name conflict verify the existing
//! object is safe to share before handing it back.

use anyhow::Result;
use k8test_core::labels::recorded_strategy;
use k8test_core::{is_already_exists, ResourceError, SingletonStrategy};
use k8test_kubehub::ResourceApi;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::{debug, info};

/// What to do when the name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// Names are random; a conflict means the naming logic is broken.
    Never,
    /// Adopt only if the existing object records the same singleton strategy.
    MatchStrategy(SingletonStrategy),
    /// Adopt whatever is there (namespaces, RBAC objects).
    Any,
}

impl Adoption {
    pub fn for_strategy(strategy: SingletonStrategy) -> Self {
        match strategy {
            SingletonStrategy::Many => Adoption::Never,
            other => Adoption::MatchStrategy(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled<K> {
    pub resource: K,
    pub is_new_resource: bool,
}

/// Create `obj`, waiting until it is ready; on conflict adopt the existing object per `adoption`.
///
/// N callers racing on one name see exactly one `is_new_resource == true`.
pub async fn create_or_adopt<K>(api: &dyn ResourceApi<K>, obj: &K, adoption: Adoption) -> Result<Reconciled<K>>
where
    K: Resource + Clone + Send + Sync,
{
    let claimed = claim(api, obj, adoption).await?;
    if !claimed.is_new_resource {
        return Ok(claimed);
    }
    let resource = api.wait_until_ready(&obj.name_any()).await?;
    Ok(Reconciled { resource, is_new_resource: true })
}

/// [`create_or_adopt`] without the readiness wait: returns as soon as the
/// object exists, as created or as adopted.
pub async fn claim<K>(api: &dyn ResourceApi<K>, obj: &K, adoption: Adoption) -> Result<Reconciled<K>>
where
    K: Resource + Clone + Send + Sync,
{
    let name = obj.name_any();
    let err = match api.create(obj).await {
        Ok(resource) => {
            counter!("k8test_resources_created_total", 1u64, "kind" => api.kind().to_string());
            return Ok(Reconciled { resource, is_new_resource: true });
        }
        Err(e) => e,
    };
    if !is_already_exists(&err) {
        return Err(err);
    }
    let kind = api.kind().to_string();
    debug!(kind = %kind, name = %name, "already exists");
    let existing = match adoption {
        Adoption::Never => return Err(ResourceError::NameCollision { kind, name }.into()),
        Adoption::Any => api.get(&name).await?,
        Adoption::MatchStrategy(expected) => {
            let existing = api.get(&name).await?;
            let found = recorded_strategy(existing.labels());
            if found != Some(expected) {
                let found = found.map(|s| s.to_string()).unwrap_or_else(|| "<none>".to_string());
                return Err(ResourceError::InconsistentClusterState(format!(
                    "{} \"{}\" exists with singleton strategy {} but {} was requested; delete it (or its namespace) and retry",
                    kind, name, found, expected
                ))
                .into());
            }
            existing
        }
    };
    counter!("k8test_resources_adopted_total", 1u64, "kind" => kind.clone());
    info!(kind = %kind, name = %name, "adopted existing resource");
    Ok(Reconciled { resource: existing, is_new_resource: false })
}
