//! k8test graph: content hashes for every package of a multi-package
//! repository, computed from the committed tree and ordered leaves-first.

#![forbid(unsafe_code)]

mod error;
mod graph;
pub mod manifest;
mod source;
mod workspace;

pub use error::PackageError;
pub use graph::{calculate_packages_hash, PackageGraph, PackageNode};
pub use manifest::PackageJson;
pub use source::{FileSource, GitTree, MemoryTree, TrackedFiles};
pub use workspace::{discover_packages, MANIFEST};
