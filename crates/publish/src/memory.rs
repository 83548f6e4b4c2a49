//! In-memory registries and script runner for tests. Like the real registries
//! they refuse to publish a version twice.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use semver::Version;

use crate::registry::{DockerImageInfo, DockerRegistry, NpmPackageInfo, NpmRegistry, ScriptRunner};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryNpmRegistry {
    packages: Mutex<BTreeMap<String, NpmPackageInfo>>,
    manifests: Mutex<BTreeMap<(String, String), serde_json::Value>>,
    published: Mutex<Vec<(String, String)>>,
    logins: AtomicUsize,
}

impl MemoryNpmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, package: &str) -> Option<NpmPackageInfo> {
        lock(&self.packages).get(package).cloned()
    }

    /// Versions of `package` currently in the registry.
    pub fn versions(&self, package: &str) -> Vec<String> {
        self.info(package).map(|i| i.versions).unwrap_or_default()
    }

    pub fn latest(&self, package: &str) -> Option<String> {
        self.info(package).and_then(|i| i.dist_tags.get("latest").cloned())
    }

    /// Every `(package, version)` published, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }

    /// The manifest that was in place when `package@version` was published.
    pub fn manifest(&self, package: &str, version: &str) -> Option<serde_json::Value> {
        lock(&self.manifests).get(&(package.to_string(), version.to_string())).cloned()
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// External unpublish: the version and a `latest` tag pointing at it go
    /// away, `latest-hash--*` tags stay behind.
    pub fn unpublish(&self, package: &str, version: &str) {
        if let Some(info) = lock(&self.packages).get_mut(package) {
            info.versions.retain(|v| v != version);
            if info.dist_tags.get("latest").map(String::as_str) == Some(version) {
                info.dist_tags.remove("latest");
            }
        }
    }
}

#[async_trait::async_trait]
impl NpmRegistry for MemoryNpmRegistry {
    async fn view(&self, package: &str) -> Result<Option<NpmPackageInfo>> {
        tokio::task::yield_now().await;
        Ok(self.info(package))
    }

    async fn login(&self) -> Result<()> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, _dir: &Path, package: &str, version: &Version, manifest: &[u8]) -> Result<()> {
        tokio::task::yield_now().await;
        let version = version.to_string();
        let manifest: serde_json::Value = serde_json::from_slice(manifest)?;
        {
            let mut packages = lock(&self.packages);
            let info = packages.entry(package.to_string()).or_default();
            if info.versions.contains(&version) {
                bail!("cannot publish over previously published version {}@{}", package, version);
            }
            info.versions.push(version.clone());
            info.dist_tags.insert("latest".to_string(), version.clone());
        }
        lock(&self.manifests).insert((package.to_string(), version.clone()), manifest);
        lock(&self.published).push((package.to_string(), version));
        Ok(())
    }

    async fn add_dist_tag(&self, package: &str, version: &Version, tag: &str) -> Result<()> {
        let mut packages = lock(&self.packages);
        let Some(info) = packages.get_mut(package) else {
            bail!("{} is not in the registry", package);
        };
        let version = version.to_string();
        if !info.versions.contains(&version) {
            bail!("{}@{} is not in the registry", package, version);
        }
        info.dist_tags.insert(tag.to_string(), version);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDockerRegistry {
    images: Mutex<BTreeMap<String, DockerImageInfo>>,
    /// `(image, version)` built locally, with the hash label.
    built: Mutex<BTreeMap<(String, String), String>>,
    pushed: Mutex<Vec<(String, String)>>,
    logins: AtomicUsize,
}

impl MemoryDockerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, image: &str) -> Option<DockerImageInfo> {
        lock(&self.images).get(image).cloned()
    }

    pub fn built(&self) -> Vec<(String, String)> {
        lock(&self.built).keys().cloned().collect()
    }

    pub fn pushed(&self) -> Vec<(String, String)> {
        lock(&self.pushed).clone()
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DockerRegistry for MemoryDockerRegistry {
    async fn inspect(&self, image: &str) -> Result<Option<DockerImageInfo>> {
        tokio::task::yield_now().await;
        Ok(self.info(image))
    }

    async fn login(&self) -> Result<()> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn build(&self, _dir: &Path, image: &str, version: &Version, hash: &str) -> Result<()> {
        tokio::task::yield_now().await;
        lock(&self.built).insert((image.to_string(), version.to_string()), hash.to_string());
        Ok(())
    }

    async fn push(&self, image: &str, version: &Version) -> Result<()> {
        let version = version.to_string();
        let Some(hash) = lock(&self.built).get(&(image.to_string(), version.clone())).cloned() else {
            bail!("{}:{} was never built", image, version);
        };
        let mut images = lock(&self.images);
        let info = images.entry(image.to_string()).or_default();
        for tag in [version.as_str(), "latest"] {
            if !info.all_tags.iter().any(|t| t == tag) {
                info.all_tags.push(tag.to_string());
            }
        }
        info.latest_hash = Some(hash);
        info.latest_tag = Some(version.clone());
        lock(&self.pushed).push((image.to_string(), version));
        Ok(())
    }
}

/// Records script runs; scripts named in `failing` fail.
#[derive(Default)]
pub struct RecordingScripts {
    runs: Mutex<Vec<(PathBuf, String)>>,
    failing: BTreeSet<PathBuf>,
}

impl RecordingScripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every script run in `dir` fails.
    pub fn failing_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.failing.insert(dir.into());
        self
    }

    pub fn runs(&self) -> Vec<(PathBuf, String)> {
        lock(&self.runs).clone()
    }
}

#[async_trait::async_trait]
impl ScriptRunner for RecordingScripts {
    async fn run(&self, dir: &Path, script: &str) -> Result<()> {
        lock(&self.runs).push((dir.to_path_buf(), script.to_string()));
        if self.failing.contains(dir) {
            bail!("{} failed in {}", script, dir.display());
        }
        Ok(())
    }
}
