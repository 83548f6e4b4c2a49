use std::path::PathBuf;
use std::sync::Arc;

use k8test_graph::{calculate_packages_hash, MemoryTree};
use k8test_publish::memory::{MemoryDockerRegistry, MemoryNpmRegistry, RecordingScripts};
use k8test_publish::{Action, PublishOptions, PublishReport, Publisher, TargetType};

const MASTER: PublishOptions = PublishOptions { dry_run: false, master_build: true, skip_tests: false };
const PR: PublishOptions = PublishOptions { dry_run: false, master_build: false, skip_tests: false };

fn manifest(name: &str, version: &str, deps: &[&str]) -> String {
    let deps: serde_json::Map<String, serde_json::Value> = deps.iter().map(|d| (d.to_string(), serde_json::Value::from("*"))).collect();
    serde_json::json!({
        "name": name,
        "version": version,
        "dependencies": deps,
        "scripts": { "test": "node test.js" }
    })
    .to_string()
}

/// `a` and `b` are independent; `app` depends on `a`, is private and ships a Dockerfile.
fn repo() -> MemoryTree {
    MemoryTree::new("/repo")
        .with_file("package.json", r#"{"private":true,"workspaces":["packages/*"]}"#)
        .with_file("packages/a/package.json", manifest("a", "1.0.0", &[]))
        .with_file("packages/a/index.js", "exports.a = 1")
        .with_file("packages/b/package.json", manifest("b", "1.0.0", &[]))
        .with_file(
            "packages/app/package.json",
            serde_json::json!({"name": "app", "version": "0.1.0", "private": true, "dependencies": {"a": "*"}}).to_string(),
        )
        .with_file("packages/app/Dockerfile", "FROM node")
}

struct Registries {
    npm: Arc<MemoryNpmRegistry>,
    docker: Arc<MemoryDockerRegistry>,
    scripts: Arc<RecordingScripts>,
}

impl Registries {
    fn new() -> Self {
        Self::with_scripts(RecordingScripts::new())
    }

    fn with_scripts(scripts: RecordingScripts) -> Self {
        Self { npm: Arc::new(MemoryNpmRegistry::new()), docker: Arc::new(MemoryDockerRegistry::new()), scripts: Arc::new(scripts) }
    }

    async fn run(&self, tree: &MemoryTree, options: PublishOptions) -> anyhow::Result<PublishReport> {
        let graph = calculate_packages_hash(tree, None).await?;
        Publisher::new(self.npm.clone(), self.docker.clone(), self.scripts.clone(), options).run(&graph).await
    }
}

fn published(report: &PublishReport) -> Vec<(String, TargetType, String)> {
    report.published().map(|o| (o.name.clone(), o.target_type, o.version.clone())).collect()
}

#[tokio::test]
async fn second_run_without_changes_publishes_nothing() {
    let reg = Registries::new();
    let tree = repo();

    let first = reg.run(&tree, MASTER).await.expect("first run");
    assert!(published(&first).contains(&("a".to_string(), TargetType::Npm, "1.0.0".to_string())));
    assert_eq!(reg.npm.versions("a"), vec!["1.0.0"]);

    let second = reg.run(&tree, MASTER).await.expect("second run");
    assert!(published(&second).is_empty());
    assert!(second.plans.iter().all(|p| !p.need_publish()));
    assert_eq!(reg.npm.versions("a"), vec!["1.0.0"]);
    assert_eq!(reg.npm.latest("a").as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn edit_publishes_a_patch_bump_and_leaves_siblings_alone() {
    let reg = Registries::new();
    reg.run(&repo(), MASTER).await.expect("first run");

    let edited = repo().with_file("packages/a/README.md", "docs");
    let report = reg.run(&edited, MASTER).await.expect("second run");
    let out = published(&report);
    assert!(out.contains(&("a".to_string(), TargetType::Npm, "1.0.1".to_string())));
    assert!(!out.iter().any(|(name, _, _)| name == "b"));
    assert_eq!(reg.npm.latest("a").as_deref(), Some("1.0.1"));
    assert_eq!(reg.npm.versions("b"), vec!["1.0.0"]);

    // `app` depends on `a`, so its image is rebuilt under a new tag.
    assert!(out.contains(&("app".to_string(), TargetType::Docker, "0.1.1".to_string())));
}

#[tokio::test]
async fn manual_version_bump_is_published_as_is() {
    let reg = Registries::new();
    reg.run(&repo(), MASTER).await.expect("first run");

    let bumped = repo().with_file("packages/a/package.json", manifest("a", "2.0.0", &[]));
    let report = reg.run(&bumped, MASTER).await.expect("second run");
    assert!(published(&report).contains(&("a".to_string(), TargetType::Npm, "2.0.0".to_string())));
    assert_eq!(reg.npm.versions("a"), vec!["1.0.0", "2.0.0"]);
}

#[tokio::test]
async fn externally_unpublished_version_is_republished() {
    let reg = Registries::new();
    let tree = repo();
    reg.run(&tree, MASTER).await.expect("first run");

    reg.npm.unpublish("a", "1.0.0");
    let report = reg.run(&tree, MASTER).await.expect("recovery run");
    assert!(published(&report).contains(&("a".to_string(), TargetType::Npm, "1.0.0".to_string())));
    assert_eq!(reg.npm.latest("a").as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn dependencies_publish_first_with_pinned_versions() {
    let reg = Registries::new();
    let tree = repo()
        .with_file("packages/a/package.json", manifest("a", "1.2.0", &[]))
        .with_file("packages/top/package.json", manifest("top", "1.0.0", &["a"]));
    reg.run(&tree, MASTER).await.expect("run");

    let order: Vec<String> = reg.npm.published().into_iter().map(|(name, _)| name).collect();
    let pos = |n: &str| order.iter().position(|p| p == n).expect("published");
    assert!(pos("a") < pos("top"));

    let top = reg.npm.manifest("top", "1.0.0").expect("manifest recorded");
    assert_eq!(top["dependencies"]["a"], "1.2.0");
    assert_eq!(top["version"], "1.0.0");

    let graph = calculate_packages_hash(&tree, None).await.expect("hash");
    let info = reg.npm.info("a").expect("a published");
    let hash = &graph.by_name("a").expect("a").package_hash;
    assert_eq!(info.dist_tags.get(&format!("latest-hash--{}", hash)).map(String::as_str), Some("1.2.0"));
}

#[tokio::test]
async fn private_package_is_docker_only_and_logins_happen_once() {
    let reg = Registries::new();
    let report = reg.run(&repo(), MASTER).await.expect("run");

    let app = report.plans.iter().find(|p| p.name == "app").expect("app planned");
    assert!(app.target(TargetType::Npm).is_none());
    assert!(app.target(TargetType::Docker).is_some());
    assert_eq!(reg.docker.info("app").and_then(|i| i.latest_tag).as_deref(), Some("0.1.0"));

    assert_eq!(reg.npm.login_count(), 1);
    assert_eq!(reg.docker.login_count(), 1);
}

#[tokio::test]
async fn pr_build_tests_and_builds_but_publishes_nothing() {
    let reg = Registries::new();
    let report = reg.run(&repo(), PR).await.expect("run");

    assert!(published(&report).is_empty());
    assert!(report.outcomes.iter().any(|o| o.name == "app" && o.action == Action::Built));
    assert!(reg.npm.published().is_empty());
    assert!(reg.docker.pushed().is_empty());
    assert_eq!(reg.docker.built(), vec![("app".to_string(), "0.1.0".to_string())]);
    assert_eq!(reg.npm.login_count(), 0);

    let ran: Vec<PathBuf> = reg.scripts.runs().into_iter().map(|(dir, _)| dir).collect();
    assert!(ran.contains(&PathBuf::from("/repo/packages/a")));
    assert!(ran.contains(&PathBuf::from("/repo/packages/b")));
}

#[tokio::test]
async fn failing_tests_publish_nothing() {
    let reg = Registries::with_scripts(RecordingScripts::new().failing_in("/repo/packages/b"));
    let err = reg.run(&repo(), MASTER).await.unwrap_err();
    assert!(format!("{:#}", err).contains("packages/b"), "{:#}", err);
    assert!(reg.npm.published().is_empty());
    assert!(reg.docker.built().is_empty());
}

#[tokio::test]
async fn skip_tests_and_dry_run() {
    let reg = Registries::with_scripts(RecordingScripts::new().failing_in("/repo/packages/b"));
    let dry = reg.run(&repo(), PublishOptions { dry_run: true, ..MASTER }).await.expect("dry run");
    assert!(dry.outcomes.is_empty());
    assert!(dry.plans.iter().any(|p| p.need_publish()));
    assert!(reg.scripts.runs().is_empty());

    reg.run(&repo(), PublishOptions { skip_tests: true, ..MASTER }).await.expect("skip tests");
    assert!(reg.scripts.runs().is_empty());
    assert_eq!(reg.npm.versions("b"), vec!["1.0.0"]);
}

#[tokio::test]
async fn invalid_manifest_version_aborts_before_publishing() {
    let reg = Registries::new();
    let tree = repo().with_file("packages/b/package.json", manifest("b", "latest", &[]));
    let err = reg.run(&tree, MASTER).await.unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("packages/b") && msg.contains("latest"), "{}", msg);
    assert!(reg.npm.published().is_empty());
}
