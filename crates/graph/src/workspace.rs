use std::collections::BTreeSet;

use crate::error::PackageError;
use crate::manifest::workspace_globs;
use crate::source::TrackedFiles;

pub const MANIFEST: &str = "package.json";

/// Package directories named by the root `package.json` workspaces globs.
/// A glob segment `*` matches exactly one path segment; a directory counts
/// only if it has a committed `package.json`.
pub fn discover_packages(files: &TrackedFiles) -> Result<Vec<String>, PackageError> {
    let Some(root_manifest) = files.get(MANIFEST) else {
        return Ok(Vec::new());
    };
    let globs = workspace_globs(root_manifest)?;
    let dirs: BTreeSet<String> = files
        .keys()
        .filter_map(|path| path.strip_suffix(MANIFEST))
        .filter_map(|dir| dir.strip_suffix('/'))
        .filter(|dir| globs.iter().any(|g| glob_matches(g, dir)))
        .map(str::to_string)
        .collect();
    Ok(dirs.into_iter().collect())
}

fn glob_matches(glob: &str, dir: &str) -> bool {
    let glob = glob.trim_start_matches("./").trim_end_matches('/');
    let want: Vec<&str> = glob.split('/').collect();
    let have: Vec<&str> = dir.split('/').collect();
    want.len() == have.len() && want.iter().zip(&have).all(|(w, h)| *w == "*" || w == h)
}

/// Normalise explicitly listed package paths (`./packages/a/` -> `packages/a`).
pub fn normalise(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}
