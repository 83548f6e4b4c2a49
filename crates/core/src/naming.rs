//! Deterministic resource names. Equal identities land on equal names, except
//! under `many` where a fresh random id is mixed into the scope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ResourceIdentity, SingletonStrategy};

/// Kubernetes DNS-1035 label limit (Service names).
pub const MAX_NAME_LEN: usize = 63;

/// Result of naming a resource for a given identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNaming {
    pub resource_name: String,
    pub resource_scope: String,
    pub strategy: SingletonStrategy,
}

/// Map an identity to `(resourceName, resourceScope)`.
///
/// `resourceName = "{scope}-{imageName with '/' -> '-'}"`, sanitised into a DNS label.
pub fn generate_resource_name(identity: &ResourceIdentity) -> ResourceNaming {
    let raw_scope = match identity.singleton_strategy {
        SingletonStrategy::Many => format!("{}-{}", random_id(), identity.app_id),
        SingletonStrategy::AppId => identity.app_id.clone(),
        SingletonStrategy::Namespace => format!("{}-{}", identity.namespace_name, identity.app_id),
    };
    let resource_scope = dns_label(&raw_scope);
    let image = identity.image_name.replace('/', "-");
    let resource_name = dns_label(&format!("{}-{}", resource_scope, image));
    ResourceNaming { resource_name, resource_scope, strategy: identity.singleton_strategy }
}

/// Short random id (10 hex chars).
pub fn random_id() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(10);
    s
}

/// Sanitise into a DNS-1035 label: lowercase `[a-z0-9-]`, starts with a letter,
/// ends alphanumeric, at most 63 chars. Over-long input is cut and suffixed with
/// a digest of the full input so distinct long inputs stay distinct.
pub fn dns_label(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' }
        })
        .collect();
    out = out.trim_matches('-').to_string();
    if out.is_empty() {
        out.push('k');
    }
    if !out.starts_with(|c: char| c.is_ascii_lowercase()) {
        out.insert_str(0, "k-");
    }
    shorten(out, raw, MAX_NAME_LEN)
}

pub(crate) fn shorten(mut s: String, full: &str, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    s.truncate(max - 9);
    let kept = s.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{}-{}", kept, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(strategy: SingletonStrategy) -> ResourceIdentity {
        ResourceIdentity::new("app1", "library/redis", "ns1", strategy)
    }

    #[test]
    fn shared_strategies_are_deterministic() {
        for strategy in [SingletonStrategy::AppId, SingletonStrategy::Namespace] {
            let a = generate_resource_name(&identity(strategy));
            let b = generate_resource_name(&identity(strategy));
            assert_eq!(a, b);
        }
        let n = generate_resource_name(&identity(SingletonStrategy::AppId));
        assert_eq!(n.resource_scope, "app1");
        assert_eq!(n.resource_name, "app1-library-redis");
        let n = generate_resource_name(&identity(SingletonStrategy::Namespace));
        assert_eq!(n.resource_scope, "ns1-app1");
        assert_eq!(n.resource_name, "ns1-app1-library-redis");
    }

    #[test]
    fn many_strategy_never_repeats() {
        let a = generate_resource_name(&identity(SingletonStrategy::Many));
        let b = generate_resource_name(&identity(SingletonStrategy::Many));
        assert_ne!(a.resource_name, b.resource_name);
        assert_ne!(a.resource_scope, b.resource_scope);
        assert!(a.resource_scope.ends_with("-app1"));
    }

    #[test]
    fn different_scopes_get_different_names() {
        let a = generate_resource_name(&ResourceIdentity::new("app1", "redis", "ns", SingletonStrategy::AppId));
        let b = generate_resource_name(&ResourceIdentity::new("app2", "redis", "ns", SingletonStrategy::AppId));
        let c = generate_resource_name(&ResourceIdentity::new("app1", "redis", "ns", SingletonStrategy::Namespace));
        assert_ne!(a.resource_name, b.resource_name);
        assert_ne!(a.resource_name, c.resource_name);
    }

    #[test]
    fn dns_label_sanitises() {
        assert_eq!(dns_label("Quay.io/Org/App:1.2"), "quay-io-org-app-1-2");
        assert_eq!(dns_label("9lives"), "k-9lives");
        assert_eq!(dns_label("--"), "k");
    }

    #[test]
    fn long_names_are_cut_deterministically() {
        let long_a = format!("{}-a", "x".repeat(80));
        let long_b = format!("{}-b", "x".repeat(80));
        let a1 = dns_label(&long_a);
        let a2 = dns_label(&long_a);
        let b = dns_label(&long_b);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.len() <= MAX_NAME_LEN);
    }
}
