use anyhow::{Context, Result};
use k8test_core::{subscription_balance, subscription_label, Labels, SubscriptionOp};
use k8test_kubehub::ResourceApi;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::info;

/// Append one `subscription-<random>=<op>` label and return the balance computed
/// from the label set the server returned.
pub async fn add_subscription_label<K>(api: &dyn ResourceApi<K>, name: &str, op: SubscriptionOp) -> Result<i64>
where
    K: Resource + Send + Sync,
{
    let (key, value) = subscription_label(op);
    let mut patch = Labels::new();
    patch.insert(key.clone(), value);
    let updated = api
        .merge_labels(name, &patch)
        .await
        .with_context(|| format!("recording {} on {} \"{}\"", op.as_str(), api.kind(), name))?;
    let balance = subscription_balance(updated.labels());
    counter!("k8test_subscription_patches_total", 1u64, "op" => op.as_str());
    info!(kind = %api.kind(), name = %name, op = op.as_str(), label = %key, balance, "subscription recorded");
    Ok(balance)
}
