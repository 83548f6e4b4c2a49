//! Dependency-ordered publishing of every package whose content changed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use k8test_graph::{PackageGraph, PackageNode};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::plan::{npm_versions, plan_packages, rewrite_manifest, PackagePlan};
use crate::registry::{image_name, DockerRegistry, NpmRegistry, ScriptRunner, HASH_TAG_PREFIX};
use crate::target::{TargetInfo, TargetType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Plan only.
    pub dry_run: bool,
    /// Publish and push; otherwise images are built and tests run, nothing leaves the machine.
    pub master_build: bool,
    pub skip_tests: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Published,
    Built,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub name: String,
    pub target_type: TargetType,
    pub version: String,
    pub action: Action,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub plans: Vec<PackagePlan>,
    pub outcomes: Vec<TargetOutcome>,
}

impl PublishReport {
    pub fn published(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.action == Action::Published)
    }
}

#[derive(Clone)]
pub struct Publisher {
    npm: Arc<dyn NpmRegistry>,
    docker: Arc<dyn DockerRegistry>,
    scripts: Arc<dyn ScriptRunner>,
    options: PublishOptions,
}

impl Publisher {
    pub fn new(npm: Arc<dyn NpmRegistry>, docker: Arc<dyn DockerRegistry>, scripts: Arc<dyn ScriptRunner>, options: PublishOptions) -> Self {
        Self { npm, docker, scripts, options }
    }

    pub async fn plan(&self, graph: &PackageGraph) -> Result<Vec<PackagePlan>> {
        plan_packages(graph, self.npm.as_ref(), self.docker.as_ref()).await
    }

    pub async fn run(&self, graph: &PackageGraph) -> Result<PublishReport> {
        let started = Instant::now();
        let plans = self.plan(graph).await?;
        let pending = plans.iter().filter(|p| p.need_publish()).count();
        info!(packages = plans.len(), pending, dry_run = self.options.dry_run, master_build = self.options.master_build, "publish plan ready");
        if self.options.dry_run || pending == 0 {
            return Ok(PublishReport { plans, outcomes: Vec::new() });
        }

        if !self.options.skip_tests {
            self.run_tests(graph, &plans).await?;
        }
        if self.options.master_build {
            self.login(&plans).await?;
        }

        let versions = npm_versions(&plans);
        let mut outcomes = Vec::new();
        for (n, tier) in graph.tiers().into_iter().enumerate() {
            let work = tier.into_iter().filter(|i| plans[*i].need_publish()).map(|i| {
                let node = &graph.nodes[i];
                let plan = &plans[i];
                let versions = &versions;
                async move { self.publish_package(node, plan, versions).await.with_context(|| format!("publishing {}", node.relative_path)) }
            });
            let done = try_join_all(work).await.with_context(|| format!("publish tier {} failed; later tiers were not attempted", n))?;
            outcomes.extend(done.into_iter().flatten());
        }

        histogram!("k8test_publish_seconds", started.elapsed().as_secs_f64());
        Ok(PublishReport { plans, outcomes })
    }

    async fn run_tests(&self, graph: &PackageGraph, plans: &[PackagePlan]) -> Result<()> {
        let runs = plans.iter().filter(|p| p.need_publish()).map(|p| &graph.nodes[p.index]).filter(|node| node.package_json.has_script("test")).map(|node| async move {
            info!(package = %node.name(), "running tests");
            self.scripts.run(&node.package_path, "test").await.with_context(|| format!("tests of {}", node.relative_path))
        });
        try_join_all(runs).await?;
        Ok(())
    }

    /// Once per batch, only for registries something will be pushed to.
    async fn login(&self, plans: &[PackagePlan]) -> Result<()> {
        let needs = |t: TargetType| plans.iter().any(|p| p.target(t).is_some_and(TargetInfo::need_publish));
        if needs(TargetType::Npm) {
            self.npm.login().await.context("npm login")?;
        }
        if needs(TargetType::Docker) {
            self.docker.login().await.context("docker login")?;
        }
        Ok(())
    }

    async fn publish_package(&self, node: &PackageNode, plan: &PackagePlan, versions: &BTreeMap<String, String>) -> Result<Vec<TargetOutcome>> {
        let mut outcomes = Vec::new();
        for target in &plan.targets {
            let Some(version) = target.new_version() else { continue };
            let outcome = |action| TargetOutcome { name: plan.name.clone(), target_type: target.target_type, version: version.to_string(), action };
            match target.target_type {
                TargetType::Npm => {
                    if !self.options.master_build {
                        info!(package = %plan.name, version = %version, "pr build, not publishing to npm");
                        continue;
                    }
                    let manifest = rewrite_manifest(&node.package_json.raw, &version.to_string(), versions);
                    let bytes = serde_json::to_vec_pretty(&manifest)?;
                    self.npm.publish(&node.package_path, &plan.name, version, &bytes).await?;
                    let tag = format!("{}{}", HASH_TAG_PREFIX, plan.package_hash);
                    if let Err(e) = self.npm.add_dist_tag(&plan.name, version, &tag).await {
                        warn!(package = %plan.name, version = %version, error = %e, "published without hash tag; next run will publish again");
                        return Err(e);
                    }
                    info!(package = %plan.name, version = %version, "published to npm");
                    counter!("k8test_packages_published_total", 1u64, "target" => "npm");
                    outcomes.push(outcome(Action::Published));
                }
                TargetType::Docker => {
                    let image = image_name(&plan.name);
                    self.docker.build(&node.package_path, &image, version, &plan.package_hash).await?;
                    if !self.options.master_build {
                        info!(image = %image, version = %version, "pr build, image built only");
                        outcomes.push(outcome(Action::Built));
                        continue;
                    }
                    self.docker.push(&image, version).await?;
                    info!(image = %image, version = %version, "pushed image");
                    counter!("k8test_packages_published_total", 1u64, "target" => "docker");
                    outcomes.push(outcome(Action::Published));
                }
            }
        }
        Ok(outcomes)
    }
}
