//! Identifying label scheme and the label-encoded subscription counter.
//!
//! Every subscribe/unsubscribe appends one uniquely keyed
//! `subscription-<random>` label; the balance is recomputed from all of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::naming::{random_id, shorten, ResourceNaming};
use crate::{ResourceIdentity, SingletonStrategy};

pub type Labels = BTreeMap<String, String>;

pub const MANAGED: &str = "k8test";
pub const IMAGE_NAME: &str = "image-name";
pub const APP_ID: &str = "app-id";
pub const SINGLETON_STRATEGY: &str = "singleton-strategy";
pub const RESOURCE_SCOPE: &str = "resource-scope";
pub const SUBSCRIPTION_PREFIX: &str = "subscription-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionOp::Subscribe => "subscribe",
            SubscriptionOp::Unsubscribe => "unsubscribe",
        }
    }

    fn weight(value: &str) -> i64 {
        match value {
            "subscribe" => 1,
            "unsubscribe" => -1,
            _ => 0,
        }
    }
}

/// Full identifying label set. Also used as pod template labels and service selector.
pub fn identity_labels(identity: &ResourceIdentity, naming: &ResourceNaming) -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED.to_string(), "true".to_string());
    labels.insert(IMAGE_NAME.to_string(), label_value(&identity.image_name));
    labels.insert(APP_ID.to_string(), label_value(&identity.app_id));
    labels.insert(SINGLETON_STRATEGY.to_string(), naming.strategy.as_str().to_string());
    labels.insert(RESOURCE_SCOPE.to_string(), naming.resource_scope.clone());
    labels
}

/// A fresh, never-reused subscription label.
pub fn subscription_label(op: SubscriptionOp) -> (String, String) {
    (format!("{}{}", SUBSCRIPTION_PREFIX, random_id()), op.as_str().to_string())
}

/// +1 per `subscribe`, -1 per `unsubscribe`, over every `subscription-*` label.
pub fn subscription_balance(labels: &Labels) -> i64 {
    labels
        .iter()
        .filter(|(k, _)| k.starts_with(SUBSCRIPTION_PREFIX))
        .map(|(_, v)| SubscriptionOp::weight(v))
        .sum()
}

/// Strategy recorded on an existing resource, if any.
pub fn recorded_strategy(labels: &Labels) -> Option<SingletonStrategy> {
    labels.get(SINGLETON_STRATEGY).and_then(|v| v.parse().ok())
}

/// Sanitise a label value: `[A-Za-z0-9-_.]`, alphanumeric at both ends, at most 63 chars.
pub fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string();
    shorten(trimmed, raw, 63)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_resource_name;

    #[test]
    fn identity_labels_carry_strategy_and_scope() {
        let id = ResourceIdentity::new("app-1", "org/api:2.0", "ns", SingletonStrategy::AppId);
        let naming = generate_resource_name(&id);
        let labels = identity_labels(&id, &naming);
        assert_eq!(labels.get(MANAGED).map(String::as_str), Some("true"));
        assert_eq!(labels.get(IMAGE_NAME).map(String::as_str), Some("org-api-2.0"));
        assert_eq!(labels.get(RESOURCE_SCOPE), Some(&naming.resource_scope));
        assert_eq!(recorded_strategy(&labels), Some(SingletonStrategy::AppId));
    }

    #[test]
    fn balance_sums_only_subscription_labels() {
        let mut labels = Labels::new();
        labels.insert(MANAGED.into(), "true".into());
        for op in [SubscriptionOp::Subscribe, SubscriptionOp::Subscribe, SubscriptionOp::Unsubscribe] {
            let (k, v) = subscription_label(op);
            labels.insert(k, v);
        }
        labels.insert("subscription-bogus".into(), "maybe".into());
        assert_eq!(subscription_balance(&labels), 1);
    }

    #[test]
    fn subscription_keys_are_unique() {
        let (a, _) = subscription_label(SubscriptionOp::Subscribe);
        let (b, _) = subscription_label(SubscriptionOp::Subscribe);
        assert_ne!(a, b);
        assert!(a.starts_with(SUBSCRIPTION_PREFIX));
    }
}
