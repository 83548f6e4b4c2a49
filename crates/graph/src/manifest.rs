use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PackageError;

/// The `package.json` fields k8test reads. The full document is kept in `raw`
/// so it can be rewritten without losing unknown fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    pub name: String,
    pub version: String,
    pub private: bool,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
    pub scripts: BTreeMap<String, String>,
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fields {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

impl PackageJson {
    /// Parse a package manifest; `package` names it in errors.
    pub fn parse(package: &str, bytes: &[u8]) -> Result<Self, PackageError> {
        let invalid = |e: serde_json::Error| PackageError::InvalidManifest { package: package.to_string(), reason: e.to_string() };
        let raw: Value = serde_json::from_slice(bytes).map_err(invalid)?;
        let fields: Fields = serde_json::from_value(raw.clone()).map_err(invalid)?;
        let name = fields.name.ok_or_else(|| PackageError::MissingField { package: package.to_string(), field: "name" })?;
        let version = fields.version.ok_or_else(|| PackageError::MissingField { package: package.to_string(), field: "version" })?;
        Ok(Self {
            name,
            version,
            private: fields.private,
            dependencies: fields.dependencies,
            dev_dependencies: fields.dev_dependencies,
            scripts: fields.scripts,
            raw,
        })
    }

    /// Names from `dependencies` and `devDependencies`.
    pub fn dependency_names(&self) -> impl Iterator<Item = &String> {
        self.dependencies.keys().chain(self.dev_dependencies.keys())
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

/// Workspace globs of a root `package.json`: either `"workspaces": [..]` or
/// `"workspaces": { "packages": [..] }`.
pub fn workspace_globs(bytes: &[u8]) -> Result<Vec<String>, PackageError> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| PackageError::InvalidManifest { package: ".".to_string(), reason: e.to_string() })?;
    let list = match raw.get("workspaces") {
        Some(Value::Array(items)) => items,
        Some(Value::Object(obj)) => match obj.get("packages") {
            Some(Value::Array(items)) => items,
            _ => return Ok(Vec::new()),
        },
        _ => return Ok(Vec::new()),
    };
    Ok(list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fields_and_keeps_the_rest() {
        let pj = PackageJson::parse(
            "packages/a",
            br#"{"name":"a","version":"1.0.0","devDependencies":{"b":"^1.0.0"},"scripts":{"test":"jest"},"license":"MIT"}"#,
        )
        .expect("valid");
        assert_eq!(pj.name, "a");
        assert!(!pj.private);
        assert_eq!(pj.dependency_names().collect::<Vec<_>>(), vec!["b"]);
        assert!(pj.has_script("test"));
        assert_eq!(pj.raw["license"], "MIT");
    }

    #[test]
    fn missing_version_names_the_package() {
        let err = PackageJson::parse("packages/a", br#"{"name":"a"}"#).unwrap_err();
        assert!(matches!(err, PackageError::MissingField { field: "version", .. }));
        assert!(err.to_string().contains("packages/a"));
    }

    #[test]
    fn workspace_globs_accept_both_shapes() {
        assert_eq!(workspace_globs(br#"{"workspaces":["packages/*"]}"#).expect("ok"), vec!["packages/*"]);
        assert_eq!(workspace_globs(br#"{"workspaces":{"packages":["libs/x"]}}"#).expect("ok"), vec!["libs/x"]);
        assert!(workspace_globs(br#"{"name":"root"}"#).expect("ok").is_empty());
    }
}
