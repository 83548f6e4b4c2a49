//! k8test publish: decide, per package and registry, whether the committed
//! content is already published, pick the next safe version, and publish in
//! dependency order.

#![forbid(unsafe_code)]

pub mod cli;
pub mod memory;
mod plan;
mod publisher;
mod registry;
mod target;
mod version;

pub use plan::{npm_versions, plan_packages, rewrite_manifest, target_types, PackagePlan, DOCKERFILE};
pub use publisher::{Action, PublishOptions, PublishReport, Publisher, TargetOutcome};
pub use registry::{image_name, DockerImageInfo, DockerRegistry, NpmPackageInfo, NpmRegistry, ScriptRunner, HASH_TAG_PREFIX, LABEL_LATEST_HASH, LABEL_LATEST_TAG};
pub use target::{PublishDecision, PublishedVersion, RegistryState, TargetInfo, TargetType};
pub use version::{calculate_new_version, VersionError};
