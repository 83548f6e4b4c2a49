//! Next version to publish, given the manifest version and what the registry
//! already holds. Never reuses a published or unpublished version number.

use semver::Version;

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("package at {package}: \"{value}\" is not a valid semantic version")]
    InvalidVersion { package: String, value: String },
}

/// npm's `inc(v, "patch")`: a prerelease is promoted to its release
/// (`1.0.0-rc.1` becomes `1.0.0`), anything else gets the next patch.
/// Build metadata is dropped either way.
fn bump_patch(v: &Version) -> Version {
    if v.pre.is_empty() {
        Version::new(v.major, v.minor, v.patch + 1)
    } else {
        Version::new(v.major, v.minor, v.patch)
    }
}

/// `v` itself if unpublished, else the first patch bump that is not published.
fn first_unpublished(mut v: Version, published: &[Version]) -> Version {
    while published.contains(&v) {
        v = bump_patch(&v);
    }
    v
}

/// Compute the version to publish.
///
/// `latest_published` is the version recorded next to a content hash (npm
/// dist-tag or docker label); `all_versions` is everything the registry lists,
/// invalid entries ignored.
pub fn calculate_new_version(package_path: &str, package_json_version: &str, latest_published: Option<&str>, all_versions: &[String]) -> Result<Version, VersionError> {
    let manifest = Version::parse(package_json_version.trim())
        .map_err(|_| VersionError::InvalidVersion { package: package_path.to_string(), value: package_json_version.to_string() })?;
    let published: Vec<Version> = all_versions.iter().filter_map(|v| Version::parse(v).ok()).collect();

    if published.is_empty() {
        return Ok(manifest);
    }
    let latest = match latest_published.and_then(|v| Version::parse(v).ok()) {
        None => return Ok(first_unpublished(manifest, &published)),
        Some(latest) => latest,
    };
    if published.contains(&latest) {
        let max = if manifest > latest { manifest } else { latest };
        return Ok(first_unpublished(max, &published));
    }
    // The recorded version was unpublished externally; it stays burnt.
    let highest = published.iter().max().cloned().unwrap_or(manifest);
    let mut burnt = published;
    burnt.push(latest);
    Ok(first_unpublished(bump_patch(&highest), &burnt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn next(pj: &str, latest: Option<&str>, all: &[&str]) -> String {
        calculate_new_version("packages/a", pj, latest, &versions(all)).expect("valid").to_string()
    }

    #[test]
    fn invalid_manifest_version_names_package_and_value() {
        let err = calculate_new_version("packages/a", "one", None, &[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("packages/a") && msg.contains("\"one\""), "{}", msg);
    }

    #[test]
    fn nothing_published_uses_manifest_version() {
        assert_eq!(next("1.2.3", None, &[]), "1.2.3");
        assert_eq!(next("1.2.3", Some("9.9.9"), &["garbage"]), "1.2.3");
    }

    #[test]
    fn no_hash_record_bumps_only_when_manifest_version_is_taken() {
        assert_eq!(next("1.0.0", None, &["1.0.0"]), "1.0.1");
        assert_eq!(next("2.0.0", None, &["1.0.0"]), "2.0.0");
    }

    #[test]
    fn recorded_latest_takes_the_max() {
        assert_eq!(next("1.0.0", Some("1.0.0"), &["1.0.0"]), "1.0.1");
        assert_eq!(next("2.0.0", Some("1.0.0"), &["1.0.0"]), "2.0.0");
        assert_eq!(next("1.0.0", Some("1.4.0"), &["1.0.0", "1.4.0"]), "1.4.1");
        assert_eq!(next("1.0.0", Some("1.0.0"), &["1.0.0", "1.0.1"]), "1.0.2");
    }

    #[test]
    fn unpublished_latest_bumps_past_the_highest_remaining() {
        assert_eq!(next("1.0.0", Some("1.0.3"), &["1.0.0", "1.0.1"]), "1.0.2");
        assert_eq!(next("5.0.0", Some("1.0.3"), &["1.0.0"]), "1.0.1");
        assert_eq!(next("1.0.0", Some("1.0.3"), &["1.0.0", "1.0.1", "1.0.2"]), "1.0.4");
    }

    #[test]
    fn prerelease_bumps_to_its_release_like_npm() {
        assert_eq!(next("1.0.0-rc.1", Some("1.0.0-rc.1"), &["1.0.0-rc.1"]), "1.0.0");
        assert_eq!(next("1.0.0-rc.1", None, &["1.0.0-rc.1", "1.0.0"]), "1.0.1");
        assert_eq!(next("2.1.0+build.7", Some("2.1.0+build.7"), &["2.1.0+build.7"]), "2.1.1");
    }
}
