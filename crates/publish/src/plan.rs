//! Per-package publish plan: which targets a package has and, for each, whether
//! the registry already holds its current content.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use k8test_graph::{PackageGraph, PackageNode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::registry::{image_name, DockerRegistry, NpmRegistry};
use crate::target::{RegistryState, TargetInfo, TargetType};

pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagePlan {
    /// Index into the graph's node list.
    pub index: usize,
    pub name: String,
    pub relative_path: String,
    pub package_hash: String,
    pub targets: Vec<TargetInfo>,
}

impl PackagePlan {
    pub fn need_publish(&self) -> bool {
        self.targets.iter().any(TargetInfo::need_publish)
    }

    pub fn target(&self, target_type: TargetType) -> Option<&TargetInfo> {
        self.targets.iter().find(|t| t.target_type == target_type)
    }
}

/// npm unless the package is private; docker when it commits a Dockerfile at its root.
pub fn target_types(node: &PackageNode) -> Vec<TargetType> {
    let mut types = Vec::new();
    if !node.package_json.private {
        types.push(TargetType::Npm);
    }
    if node.tracks(DOCKERFILE) {
        types.push(TargetType::Docker);
    }
    types
}

async fn plan_package(index: usize, node: &PackageNode, npm: &dyn NpmRegistry, docker: &dyn DockerRegistry) -> Result<PackagePlan> {
    let mut targets = Vec::new();
    for target_type in target_types(node) {
        let state = match target_type {
            TargetType::Npm => npm.view(node.name()).await?.map(|info| info.registry_state(&node.package_hash)),
            TargetType::Docker => docker.inspect(&image_name(node.name())).await?.map(|info| info.registry_state()),
        }
        .unwrap_or_else(RegistryState::default);
        debug!(package = %node.name(), target = %target_type, latest = ?state.latest, versions = state.all_versions.len(), "registry state");
        targets.push(TargetInfo::decide(target_type, &node.relative_path, &node.package_json.version, &node.package_hash, &state)?);
    }
    Ok(PackagePlan { index, name: node.name().to_string(), relative_path: node.relative_path.clone(), package_hash: node.package_hash.clone(), targets })
}

/// Query every registry for every package, in graph order.
pub async fn plan_packages(graph: &PackageGraph, npm: &dyn NpmRegistry, docker: &dyn DockerRegistry) -> Result<Vec<PackagePlan>> {
    try_join_all(graph.nodes.iter().enumerate().map(|(i, node)| async move {
        plan_package(i, node, npm, docker).await.with_context(|| format!("planning {}", node.relative_path))
    }))
    .await
}

/// Version each package will carry after this run: the npm version about to
/// be published or already latest. Packages without an npm target are absent.
pub fn npm_versions(plans: &[PackagePlan]) -> BTreeMap<String, String> {
    plans.iter().filter_map(|p| p.target(TargetType::Npm).map(|t| (p.name.clone(), t.effective_version()))).collect()
}

/// The manifest actually published: `version` replaced and every in-repo
/// dependency pinned to the version it carries after this run.
pub fn rewrite_manifest(raw: &Value, version: &str, dep_versions: &BTreeMap<String, String>) -> Value {
    let mut manifest = raw.clone();
    if let Some(obj) = manifest.as_object_mut() {
        obj.insert("version".to_string(), Value::from(version));
        for section in ["dependencies", "devDependencies", "peerDependencies"] {
            if let Some(deps) = obj.get_mut(section).and_then(Value::as_object_mut) {
                for (name, range) in deps.iter_mut() {
                    if let Some(v) = dep_versions.get(name) {
                        *range = Value::from(v.as_str());
                    }
                }
            }
        }
    }
    manifest
}
