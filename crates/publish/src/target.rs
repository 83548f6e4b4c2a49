use semver::Version;
use serde::{Deserialize, Serialize};

use crate::version::{calculate_new_version, VersionError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Npm,
    Docker,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Npm => "npm",
            TargetType::Docker => "docker",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// The version tagged latest, with the content hash recorded when it was published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedVersion {
    pub version: String,
    pub hash: String,
}

/// What a registry currently knows about one artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    pub latest: Option<PublishedVersion>,
    pub all_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PublishDecision {
    #[serde(rename_all = "camelCase")]
    Publish { new_version: Version, latest_published_version: Option<PublishedVersion> },
    #[serde(rename_all = "camelCase")]
    UpToDate { latest_published_version: PublishedVersion },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_type: TargetType,
    #[serde(flatten)]
    pub decision: PublishDecision,
}

impl TargetInfo {
    /// Publish when nothing is recorded, the recorded hash differs, or the
    /// recorded version has disappeared from the registry.
    pub fn decide(target_type: TargetType, package_path: &str, package_json_version: &str, package_hash: &str, state: &RegistryState) -> Result<Self, VersionError> {
        let decision = match &state.latest {
            Some(latest) if latest.hash == package_hash && state.all_versions.contains(&latest.version) => {
                PublishDecision::UpToDate { latest_published_version: latest.clone() }
            }
            latest => PublishDecision::Publish {
                new_version: calculate_new_version(package_path, package_json_version, latest.as_ref().map(|l| l.version.as_str()), &state.all_versions)?,
                latest_published_version: latest.clone(),
            },
        };
        Ok(Self { target_type, decision })
    }

    pub fn need_publish(&self) -> bool {
        matches!(self.decision, PublishDecision::Publish { .. })
    }

    pub fn new_version(&self) -> Option<&Version> {
        match &self.decision {
            PublishDecision::Publish { new_version, .. } => Some(new_version),
            PublishDecision::UpToDate { .. } => None,
        }
    }

    /// The version dependents should pin: the one about to be published, else the current latest.
    pub fn effective_version(&self) -> String {
        match &self.decision {
            PublishDecision::Publish { new_version, .. } => new_version.to_string(),
            PublishDecision::UpToDate { latest_published_version } => latest_published_version.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(latest: Option<(&str, &str)>, all: &[&str]) -> RegistryState {
        RegistryState {
            latest: latest.map(|(v, h)| PublishedVersion { version: v.into(), hash: h.into() }),
            all_versions: all.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn same_hash_and_version_present_is_up_to_date() {
        let info = TargetInfo::decide(TargetType::Npm, "a", "1.0.0", "h1", &state(Some(("1.0.0", "h1")), &["1.0.0"])).expect("ok");
        assert!(!info.need_publish());
        assert_eq!(info.effective_version(), "1.0.0");
    }

    #[test]
    fn changed_hash_publishes_a_bump() {
        let info = TargetInfo::decide(TargetType::Npm, "a", "1.0.0", "h2", &state(Some(("1.0.0", "h1")), &["1.0.0"])).expect("ok");
        assert_eq!(info.new_version().map(ToString::to_string).as_deref(), Some("1.0.1"));
    }

    #[test]
    fn vanished_version_is_republished() {
        let info = TargetInfo::decide(TargetType::Docker, "a", "1.0.0", "h1", &state(Some(("1.0.0", "h1")), &[])).expect("ok");
        assert_eq!(info.new_version().map(ToString::to_string).as_deref(), Some("1.0.0"));
    }

    #[test]
    fn serialises_with_target_type_and_status() {
        let info = TargetInfo::decide(TargetType::Npm, "a", "1.0.0", "h", &RegistryState::default()).expect("ok");
        let json = serde_json::to_value(&info).expect("json");
        assert_eq!(json["targetType"], "npm");
        assert_eq!(json["status"], "publish");
        assert_eq!(json["newVersion"], "1.0.0");
    }
}
