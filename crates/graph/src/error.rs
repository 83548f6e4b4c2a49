/// Configuration errors in the repository's package layout. All are fatal.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("package at {package}: package.json has no \"{field}\"")]
    MissingField { package: String, field: &'static str },

    #[error("package at {package}: invalid package.json: {reason}")]
    InvalidManifest { package: String, reason: String },

    #[error("package name {name} is used by both {first} and {second}")]
    DuplicateName { name: String, first: String, second: String },

    #[error("dependency cycle through package {package}")]
    DependencyCycle { package: String },

    #[error("no committed package.json under {package}")]
    UnknownPackage { package: String },
}
