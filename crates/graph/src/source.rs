//! Where the hashed file set comes from. Only committed content counts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// Tracked files keyed by `/`-separated path relative to the repository root.
pub type TrackedFiles = BTreeMap<String, Vec<u8>>;

#[async_trait::async_trait]
pub trait FileSource: Send + Sync {
    /// Absolute repository root.
    fn root(&self) -> &Path;

    async fn tracked_files(&self) -> Result<TrackedFiles>;
}

/// Files of the `HEAD` commit, read through git plumbing.
pub struct GitTree {
    root: PathBuf,
    rev: String,
}

impl GitTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), rev: "HEAD".to_string() }
    }

    async fn list_blobs(&self) -> Result<Vec<(String, String)>> {
        let out = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["ls-tree", "-r", "-z", &self.rev])
            .output()
            .await
            .context("running git ls-tree")?;
        if !out.status.success() {
            bail!("git ls-tree {} failed in {}: {}", self.rev, self.root.display(), String::from_utf8_lossy(&out.stderr).trim());
        }
        parse_ls_tree(&out.stdout)
    }

    async fn read_blobs(&self, ids: Vec<String>) -> Result<Vec<Vec<u8>>> {
        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("spawning git cat-file")?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("git cat-file: no stdin"))?;
        let request: String = ids.iter().map(|id| format!("{}\n", id)).collect();
        let writer = tokio::spawn(async move {
            stdin.write_all(request.as_bytes()).await?;
            stdin.shutdown().await
        });
        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("git cat-file: no stdout"))?;
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.context("reading git cat-file output")?;
        writer.await.context("git cat-file writer task")?.context("writing object ids to git cat-file")?;
        let status = child.wait().await.context("waiting for git cat-file")?;
        if !status.success() {
            bail!("git cat-file --batch exited with {}", status);
        }
        parse_cat_file_batch(&buf, ids.len())
    }
}

#[async_trait::async_trait]
impl FileSource for GitTree {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn tracked_files(&self) -> Result<TrackedFiles> {
        let blobs = self.list_blobs().await?;
        let (paths, ids): (Vec<String>, Vec<String>) = blobs.into_iter().unzip();
        let contents = self.read_blobs(ids).await?;
        debug!(root = %self.root.display(), files = paths.len(), "read committed tree");
        Ok(paths.into_iter().zip(contents).collect())
    }
}

/// `<mode> SP <type> SP <object> TAB <path> NUL`; keeps blobs only (submodules are commits).
fn parse_ls_tree(out: &[u8]) -> Result<Vec<(String, String)>> {
    let mut blobs = Vec::new();
    for entry in out.split(|b| *b == 0).filter(|e| !e.is_empty()) {
        let entry = std::str::from_utf8(entry).context("non utf-8 path in git ls-tree output")?;
        let (meta, path) = entry.split_once('\t').ok_or_else(|| anyhow!("malformed ls-tree entry: {}", entry))?;
        let mut parts = meta.split(' ');
        let (_mode, kind, id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(k), Some(i)) => (m, k, i),
            _ => bail!("malformed ls-tree entry: {}", entry),
        };
        if kind == "blob" {
            blobs.push((path.to_string(), id.to_string()));
        }
    }
    Ok(blobs)
}

/// `<object> SP <type> SP <size> LF <contents> LF`, once per requested object.
fn parse_cat_file_batch(mut buf: &[u8], expected: usize) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(expected);
    while out.len() < expected {
        let nl = buf.iter().position(|b| *b == b'\n').ok_or_else(|| anyhow!("truncated git cat-file header"))?;
        let header = std::str::from_utf8(&buf[..nl]).context("git cat-file header")?;
        let size: usize = header
            .rsplit(' ')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("unexpected git cat-file header: {}", header))?;
        let start = nl + 1;
        let end = start + size;
        if buf.len() < end + 1 {
            bail!("truncated git cat-file body for {}", header);
        }
        out.push(buf[start..end].to_vec());
        buf = &buf[end + 1..];
    }
    Ok(out)
}

/// In-memory tree for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    root: PathBuf,
    files: TrackedFiles,
}

impl MemoryTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), files: TrackedFiles::new() }
    }

    pub fn with_file(mut self, path: &str, contents: impl AsRef<[u8]>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: &str, contents: impl AsRef<[u8]>) {
        self.files.insert(path.to_string(), contents.as_ref().to_vec());
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }
}

#[async_trait::async_trait]
impl FileSource for MemoryTree {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn tracked_files(&self) -> Result<TrackedFiles> {
        Ok(self.files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ls_tree_keeps_blobs_only() {
        let out = b"100644 blob aaa\tpackage.json\0160000 commit bbb\tvendor/sub\0100755 blob ccc\tpackages/a/run me.sh\0";
        let blobs = parse_ls_tree(out).expect("parse");
        assert_eq!(blobs, vec![("package.json".to_string(), "aaa".to_string()), ("packages/a/run me.sh".to_string(), "ccc".to_string())]);
    }

    #[test]
    fn cat_file_batch_splits_on_sizes() {
        let buf = b"aaa blob 5\nhello\nccc blob 0\n\nddd blob 3\na\nb\n";
        let blobs = parse_cat_file_batch(buf, 3).expect("parse");
        assert_eq!(blobs, vec![b"hello".to_vec(), Vec::new(), b"a\nb".to_vec()]);
        assert!(parse_cat_file_batch(b"aaa blob 10\nshort\n", 1).is_err());
    }
}
