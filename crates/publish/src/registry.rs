//! Registry seams. The CLI-backed implementations live in `cli`, in-memory
//! ones in `memory`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::target::{PublishedVersion, RegistryState};

/// npm dist-tag prefix recording the content hash of a published version.
pub const HASH_TAG_PREFIX: &str = "latest-hash--";
/// OCI label keys stamped on docker images.
pub const LABEL_LATEST_HASH: &str = "latest-hash";
pub const LABEL_LATEST_TAG: &str = "latest-tag";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// The part of `npm view <pkg> --json` k8test reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmPackageInfo {
    #[serde(default, deserialize_with = "one_or_many")]
    pub versions: Vec<String>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

fn one_or_many<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    })
}

impl NpmPackageInfo {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `latest` plus the hash of whichever `latest-hash--<hash>` tag points at it.
    /// With several candidates, `preferred_hash` wins, else the first by name.
    pub fn registry_state(&self, preferred_hash: &str) -> RegistryState {
        let latest = self.dist_tags.get("latest").and_then(|version| {
            let all: Vec<&str> = self
                .dist_tags
                .iter()
                .filter(|(tag, v)| *v == version && tag.starts_with(HASH_TAG_PREFIX))
                .map(|(tag, _)| &tag[HASH_TAG_PREFIX.len()..])
                .collect();
            let hash = all.iter().find(|h| **h == preferred_hash).or_else(|| all.first()).map(|h| h.to_string())?;
            Some(PublishedVersion { version: version.clone(), hash })
        });
        RegistryState { latest, all_versions: self.versions.clone() }
    }
}

/// The labels and tags of a docker repository's `latest` image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerImageInfo {
    pub latest_hash: Option<String>,
    pub latest_tag: Option<String>,
    pub all_tags: Vec<String>,
}

#[derive(Deserialize)]
struct SkopeoInspect {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
}

impl DockerImageInfo {
    /// Parse `skopeo inspect` output.
    pub fn from_skopeo(json: &str) -> Result<Self> {
        let raw: SkopeoInspect = serde_json::from_str(json)?;
        let labels = raw.labels.unwrap_or_default();
        Ok(Self { latest_hash: labels.get(LABEL_LATEST_HASH).cloned(), latest_tag: labels.get(LABEL_LATEST_TAG).cloned(), all_tags: raw.repo_tags })
    }

    pub fn registry_state(&self) -> RegistryState {
        let latest = match (&self.latest_tag, &self.latest_hash) {
            (Some(version), Some(hash)) => Some(PublishedVersion { version: version.clone(), hash: hash.clone() }),
            _ => None,
        };
        RegistryState { latest, all_versions: self.all_tags.clone() }
    }
}

#[async_trait::async_trait]
pub trait NpmRegistry: Send + Sync {
    /// `None` when the package was never published (or fully unpublished).
    async fn view(&self, package: &str) -> Result<Option<NpmPackageInfo>>;
    async fn login(&self) -> Result<()>;
    /// Publish `dir` with `manifest` in place of its committed `package.json`.
    async fn publish(&self, dir: &Path, package: &str, version: &Version, manifest: &[u8]) -> Result<()>;
    async fn add_dist_tag(&self, package: &str, version: &Version, tag: &str) -> Result<()>;
}

#[async_trait::async_trait]
pub trait DockerRegistry: Send + Sync {
    async fn inspect(&self, image: &str) -> Result<Option<DockerImageInfo>>;
    async fn login(&self) -> Result<()>;
    /// Build `image:version` and `image:latest` from `dir`, labelled with hash and version.
    async fn build(&self, dir: &Path, image: &str, version: &Version, hash: &str) -> Result<()>;
    /// Push `image:version` and `image:latest`.
    async fn push(&self, image: &str, version: &Version) -> Result<()>;
}

/// Runs a package script before anything is published.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, dir: &Path, script: &str) -> Result<()>;
}

/// Docker repository name for an npm package name (`@org/api` -> `org/api`).
pub fn image_name(package: &str) -> String {
    package.trim_start_matches('@').to_ascii_lowercase()
}
