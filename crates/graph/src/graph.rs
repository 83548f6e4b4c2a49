//! Package hash graph: per-package content hashes that fold in shared root
//! files and, bottom-up, every in-repo dependency's hash.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::histogram;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::PackageError;
use crate::manifest::PackageJson;
use crate::source::{FileSource, TrackedFiles};
use crate::workspace::{discover_packages, normalise, MANIFEST};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageNode {
    /// Package directory relative to the repository root (`packages/a`).
    pub relative_path: String,
    /// Absolute package directory.
    pub package_path: PathBuf,
    pub package_json: PackageJson,
    pub package_hash: String,
    /// In-repo dependencies (indexes into the ordered node list).
    pub children_indexes: Vec<usize>,
    /// In-repo dependents.
    pub parents_indexes: Vec<usize>,
    /// Committed files, relative to the package directory.
    #[serde(skip)]
    pub files: Vec<String>,
}

impl PackageNode {
    pub fn name(&self) -> &str {
        &self.package_json.name
    }

    pub fn tracks(&self, relative: &str) -> bool {
        self.files.iter().any(|f| f == relative)
    }
}

/// Packages ordered leaves-first: every node comes after all of its children.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageGraph {
    pub root: PathBuf,
    pub root_files_hash: String,
    pub nodes: Vec<PackageNode>,
}

impl PackageGraph {
    pub fn by_name(&self, name: &str) -> Option<&PackageNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Group node indexes by height: tier 0 has no in-repo dependencies, tier n
    /// depends on something in tier n-1 and nothing higher.
    pub fn tiers(&self) -> Vec<Vec<usize>> {
        let mut height = vec![0usize; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            height[i] = node.children_indexes.iter().map(|c| height[*c] + 1).max().unwrap_or(0);
        }
        let mut tiers: Vec<Vec<usize>> = Vec::new();
        for (i, h) in height.into_iter().enumerate() {
            if tiers.len() <= h {
                tiers.resize_with(h + 1, Vec::new);
            }
            tiers[h].push(i);
        }
        tiers
    }
}

fn hash_files<'a>(files: impl Iterator<Item = (&'a str, &'a [u8])>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(Sha256::digest(contents));
    }
    hex::encode(hasher.finalize())
}

fn combine<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Hash every package of the committed tree of `source`.
///
/// `package_paths` lists package directories explicitly; `None` discovers them
/// from the root `package.json` workspaces.
pub async fn calculate_packages_hash(source: &dyn FileSource, package_paths: Option<&[String]>) -> Result<PackageGraph> {
    let started = Instant::now();
    let files = source.tracked_files().await.with_context(|| format!("listing committed files under {}", source.root().display()))?;
    let mut paths: Vec<String> = match package_paths {
        Some(list) => list.iter().map(|p| normalise(p)).collect(),
        None => discover_packages(&files)?,
    };
    paths.sort();
    paths.dedup();
    let graph = build(source.root().to_path_buf(), &files, &paths)?;
    histogram!("k8test_hash_seconds", started.elapsed().as_secs_f64());
    info!(root = %graph.root.display(), packages = graph.nodes.len(), files = files.len(), "package hashes computed");
    Ok(graph)
}

fn build(root: PathBuf, files: &TrackedFiles, paths: &[String]) -> Result<PackageGraph, PackageError> {
    let mut manifests = Vec::with_capacity(paths.len());
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (i, path) in paths.iter().enumerate() {
        let bytes = files.get(&format!("{}/{}", path, MANIFEST)).ok_or_else(|| PackageError::UnknownPackage { package: path.clone() })?;
        let pj = PackageJson::parse(path, bytes)?;
        if let Some(first) = by_name.insert(pj.name.clone(), i) {
            return Err(PackageError::DuplicateName { name: pj.name.clone(), first: paths[first].clone(), second: path.clone() });
        }
        manifests.push(pj);
    }

    // Deepest package directory wins for nested layouts.
    let mut owners: Vec<usize> = (0..paths.len()).collect();
    owners.sort_by_key(|i| std::cmp::Reverse(paths[*i].len()));
    let mut own_files: Vec<BTreeMap<&str, &[u8]>> = vec![BTreeMap::new(); paths.len()];
    let mut root_files: BTreeMap<&str, &[u8]> = BTreeMap::new();
    for (path, contents) in files {
        let owner = owners.iter().copied().find(|i| path.strip_prefix(paths[*i].as_str()).is_some_and(|rest| rest.starts_with('/')));
        match owner {
            Some(i) => {
                own_files[i].insert(&path[paths[i].len() + 1..], contents.as_slice());
            }
            None => {
                root_files.insert(path.as_str(), contents.as_slice());
            }
        }
    }
    let root_files_hash = hash_files(root_files.into_iter());
    let base_hashes: Vec<String> = own_files
        .iter()
        .map(|own| combine([root_files_hash.as_str(), hash_files(own.iter().map(|(p, c)| (*p, *c))).as_str()].into_iter()))
        .collect();
    let own_paths: Vec<Vec<String>> = own_files.iter().map(|own| own.keys().map(|k| k.to_string()).collect()).collect();

    // Edges point from dependency to dependent so a topological order is leaves-first.
    let mut g: DiGraph<usize, ()> = DiGraph::new();
    let ids: Vec<NodeIndex> = (0..paths.len()).map(|i| g.add_node(i)).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); paths.len()];
    for (i, pj) in manifests.iter().enumerate() {
        for dep in pj.dependency_names() {
            if let Some(&c) = by_name.get(dep) {
                if !children[i].contains(&c) {
                    children[i].push(c);
                    g.add_edge(ids[c], ids[i], ());
                }
            }
        }
    }
    let order = toposort(&g, None).map_err(|cycle| PackageError::DependencyCycle { package: manifests[g[cycle.node_id()]].name.clone() })?;
    let order: Vec<usize> = order.into_iter().map(|n| g[n]).collect();

    let mut position = vec![0usize; paths.len()];
    for (pos, old) in order.iter().enumerate() {
        position[*old] = pos;
    }
    let mut final_hashes: Vec<String> = vec![String::new(); paths.len()];
    for &old in &order {
        children[old].sort();
        final_hashes[old] = combine(
            [root_files_hash.as_str(), base_hashes[old].as_str()]
                .into_iter()
                .chain(children[old].iter().map(|c| final_hashes[*c].as_str())),
        );
    }

    let mut staged: Vec<(usize, usize, PackageJson)> = manifests.into_iter().enumerate().map(|(old, pj)| (position[old], old, pj)).collect();
    staged.sort_by_key(|(pos, _, _)| *pos);
    let mut nodes: Vec<PackageNode> = staged
        .into_iter()
        .map(|(_, old, package_json)| {
            debug!(package = %package_json.name, hash = %final_hashes[old], deps = children[old].len(), "package hashed");
            PackageNode {
                relative_path: paths[old].clone(),
                package_path: root.join(&paths[old]),
                package_json,
                package_hash: final_hashes[old].clone(),
                children_indexes: children[old].iter().map(|c| position[*c]).collect(),
                parents_indexes: Vec::new(),
                files: own_paths[old].clone(),
            }
        })
        .collect();
    for i in 0..nodes.len() {
        for c in nodes[i].children_indexes.clone() {
            nodes[c].parents_indexes.push(i);
        }
    }
    Ok(PackageGraph { root, root_files_hash, nodes })
}
