//! Registries driven through the `npm`, `docker` and `skopeo` executables.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use semver::Version;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::registry::{DockerImageInfo, DockerRegistry, NpmPackageInfo, NpmRegistry, ScriptRunner, LABEL_LATEST_HASH, LABEL_LATEST_TAG};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

async fn output(cmd: &mut Command, what: &str) -> Result<CommandOutput> {
    debug!(command = ?cmd.as_std(), "running");
    let out = cmd.stdin(Stdio::null()).output().await.with_context(|| format!("spawning {}", what))?;
    Ok(out.into())
}

async fn checked(cmd: &mut Command, what: &str) -> Result<CommandOutput> {
    let out = output(cmd, what).await?;
    if !out.success {
        bail!("{} failed: {}", what, out.stderr.trim());
    }
    Ok(out)
}

/// Registry host with scheme and trailing slash stripped (`https://r.io/` -> `r.io`).
fn host(registry: &str) -> &str {
    registry.trim_start_matches("https://").trim_start_matches("http://").trim_end_matches('/')
}

/// Swaps a package's `package.json` for the duration of a publish; the
/// committed bytes come back on [`ManifestSwap::restore`] or on drop.
pub struct ManifestSwap {
    path: PathBuf,
    original: Option<Vec<u8>>,
}

impl ManifestSwap {
    pub async fn install(dir: &Path, manifest: &[u8]) -> Result<Self> {
        let path = dir.join("package.json");
        let original = tokio::fs::read(&path).await.with_context(|| format!("reading {}", path.display()))?;
        tokio::fs::write(&path, manifest).await.with_context(|| format!("writing {}", path.display()))?;
        Ok(Self { path, original: Some(original) })
    }

    pub async fn restore(mut self) -> Result<()> {
        if let Some(original) = self.original.take() {
            tokio::fs::write(&self.path, original).await.with_context(|| format!("restoring {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for ManifestSwap {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(e) = std::fs::write(&self.path, original) {
                warn!(path = %self.path.display(), error = %e, "could not restore package.json");
            }
        }
    }
}

pub struct NpmCli {
    registry: String,
    token: Option<String>,
}

impl NpmCli {
    pub fn new(registry: impl Into<String>, token: Option<String>) -> Self {
        Self { registry: registry.into(), token }
    }
}

#[async_trait::async_trait]
impl NpmRegistry for NpmCli {
    async fn view(&self, package: &str) -> Result<Option<NpmPackageInfo>> {
        let out = output(Command::new("npm").args(["view", package, "--json", "--registry", &self.registry]), "npm view").await?;
        if !out.success {
            if out.stderr.contains("E404") || out.stdout.contains("E404") {
                return Ok(None);
            }
            bail!("npm view {} failed: {}", package, out.stderr.trim());
        }
        if out.stdout.trim().is_empty() {
            return Ok(None);
        }
        NpmPackageInfo::parse(&out.stdout).map(Some).with_context(|| format!("parsing npm view {}", package))
    }

    async fn login(&self) -> Result<()> {
        let token = self.token.as_deref().ok_or_else(|| anyhow!("no npm token configured for {}", self.registry))?;
        let key = format!("//{}/:_authToken", host(&self.registry));
        checked(Command::new("npm").args(["config", "set", &key, token]), "npm config set").await?;
        info!(registry = %self.registry, "npm credentials configured");
        Ok(())
    }

    async fn publish(&self, dir: &Path, package: &str, version: &Version, manifest: &[u8]) -> Result<()> {
        let swap = ManifestSwap::install(dir, manifest).await?;
        let res = checked(Command::new("npm").args(["publish", "--registry", &self.registry]).current_dir(dir), "npm publish").await;
        swap.restore().await?;
        res.with_context(|| format!("publishing {}@{}", package, version))?;
        Ok(())
    }

    async fn add_dist_tag(&self, package: &str, version: &Version, tag: &str) -> Result<()> {
        let spec = format!("{}@{}", package, version);
        checked(Command::new("npm").args(["dist-tag", "add", &spec, tag, "--registry", &self.registry]), "npm dist-tag add").await?;
        Ok(())
    }
}

pub struct DockerCli {
    registry: String,
    username: Option<String>,
    password: Option<String>,
    tls_verify: bool,
}

impl DockerCli {
    /// TLS is verified unless the registry is given as `http://`.
    pub fn new(registry: impl Into<String>, username: Option<String>, password: Option<String>) -> Self {
        let registry = registry.into();
        let tls_verify = !registry.starts_with("http://");
        Self { registry, username, password, tls_verify }
    }

    /// Override certificate checks for registries with self-signed certificates.
    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    fn inspect_args(&self, reference: &str) -> Vec<String> {
        let mut args = vec!["inspect".to_string()];
        if !self.tls_verify {
            args.push("--tls-verify=false".to_string());
        }
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            args.push("--creds".to_string());
            args.push(format!("{}:{}", user, pass));
        }
        args.push(reference.to_string());
        args
    }

    fn reference(&self, image: &str, tag: &str) -> String {
        format!("{}/{}:{}", host(&self.registry), image, tag)
    }
}

#[async_trait::async_trait]
impl DockerRegistry for DockerCli {
    async fn inspect(&self, image: &str) -> Result<Option<DockerImageInfo>> {
        let reference = format!("docker://{}", self.reference(image, "latest"));
        let out = output(Command::new("skopeo").args(self.inspect_args(&reference)), "skopeo inspect").await?;
        if !out.success {
            let err = out.stderr.to_ascii_lowercase();
            if err.contains("manifest unknown") || err.contains("not found") || err.contains("name unknown") {
                return Ok(None);
            }
            bail!("skopeo inspect {} failed: {}", reference, out.stderr.trim());
        }
        DockerImageInfo::from_skopeo(&out.stdout).map(Some).with_context(|| format!("parsing skopeo inspect {}", reference))
    }

    async fn login(&self) -> Result<()> {
        let (user, pass) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => bail!("no docker credentials configured for {}", self.registry),
        };
        let mut child = Command::new("docker")
            .args(["login", host(&self.registry), "--username", user, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning docker login")?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("docker login: no stdin"))?;
        stdin.write_all(pass.as_bytes()).await.context("writing docker password")?;
        drop(stdin);
        let out: CommandOutput = child.wait_with_output().await.context("waiting for docker login")?.into();
        if !out.success {
            bail!("docker login {} failed: {}", self.registry, out.stderr.trim());
        }
        info!(registry = %self.registry, "docker login");
        Ok(())
    }

    async fn build(&self, dir: &Path, image: &str, version: &Version, hash: &str) -> Result<()> {
        let versioned = self.reference(image, &version.to_string());
        let latest = self.reference(image, "latest");
        checked(
            Command::new("docker")
                .args(["build", "-t", &versioned, "-t", &latest])
                .arg("--label")
                .arg(format!("{}={}", LABEL_LATEST_HASH, hash))
                .arg("--label")
                .arg(format!("{}={}", LABEL_LATEST_TAG, version))
                .arg(dir),
            "docker build",
        )
        .await
        .with_context(|| format!("building {}", versioned))?;
        Ok(())
    }

    async fn push(&self, image: &str, version: &Version) -> Result<()> {
        for tag in [version.to_string(), "latest".to_string()] {
            let reference = self.reference(image, &tag);
            checked(Command::new("docker").args(["push", &reference]), "docker push").await.with_context(|| format!("pushing {}", reference))?;
        }
        Ok(())
    }
}

/// `npm run <script>` in the package directory.
pub struct NpmScripts;

#[async_trait::async_trait]
impl ScriptRunner for NpmScripts {
    async fn run(&self, dir: &Path, script: &str) -> Result<()> {
        let out = output(Command::new("npm").args(["run", script]).current_dir(dir), "npm run").await?;
        if !out.success {
            bail!("npm run {} failed in {}:\n{}{}", script, dir.display(), out.stdout, out.stderr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_host_strips_scheme() {
        assert_eq!(host("https://registry.example.com/"), "registry.example.com");
        assert_eq!(host("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn skopeo_verifies_tls_unless_told_otherwise() {
        let reference = "docker://docker.io/app:latest";
        let public = DockerCli::new("docker.io", None, None);
        assert_eq!(public.inspect_args(reference), vec!["inspect", reference]);

        let plain = DockerCli::new("http://localhost:5000", None, None);
        assert!(plain.inspect_args(reference).contains(&"--tls-verify=false".to_string()));

        let insecure = DockerCli::new("https://registry.local", Some("ci".into()), Some("secret".into())).with_tls_verify(false);
        assert_eq!(insecure.inspect_args(reference), vec!["inspect", "--tls-verify=false", "--creds", "ci:secret", reference]);
    }

    #[tokio::test]
    async fn manifest_swap_restores_committed_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("package.json");
        std::fs::write(&path, br#"{"name":"a","version":"1.0.0"}"#).expect("write");

        let swap = ManifestSwap::install(dir.path(), br#"{"name":"a","version":"1.0.1"}"#).await.expect("install");
        assert!(std::fs::read_to_string(&path).expect("read").contains("1.0.1"));
        swap.restore().await.expect("restore");
        assert!(std::fs::read_to_string(&path).expect("read").contains("1.0.0"));

        {
            let _swap = ManifestSwap::install(dir.path(), b"{}").await.expect("install");
        }
        assert!(std::fs::read_to_string(&path).expect("read").contains("1.0.0"));
    }
}
