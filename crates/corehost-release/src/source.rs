//! Local checkout of the upstream source tree.
//!
//! Deployment step one brings the checkout up to date and reports a
//! fingerprint of what was synchronized. The fingerprint ends up in the
//! registry's `lastDeployed` record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::content;
use crate::error::{ReleaseError, Result};

/// A synchronized source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// Root of the checkout.
    pub root: PathBuf,
    /// Identifies the synchronized content (commit hash or tree digest).
    pub fingerprint: String,
}

/// Something that can bring a source checkout up to date.
#[async_trait]
pub trait SourceTree: Send + Sync + 'static {
    /// Synchronizes the checkout with upstream.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::UpstreamUnavailable`] if upstream cannot be
    /// reached or [`ReleaseError::Io`] if the checkout cannot be read.
    async fn synchronize(&self) -> Result<SourceSnapshot>;

    /// Root of the checkout.
    fn root(&self) -> &Path;
}

/// Uses an already-populated directory as-is.
///
/// The fingerprint is a digest over every file in the tree.
#[derive(Debug, Clone)]
pub struct LocalSourceTree {
    root: PathBuf,
    timeout: Duration,
}

impl LocalSourceTree {
    /// Creates a source rooted at `root`; hashing is bounded by `timeout`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SourceTree for LocalSourceTree {
    async fn synchronize(&self) -> Result<SourceSnapshot> {
        if !self.root.is_dir() {
            return Err(ReleaseError::io(
                "synchronize source",
                format!("{} is not a directory", self.root.display()),
            ));
        }
        let root = self.root.clone();
        let hashed = timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || content::hash_tree(&root)),
        )
        .await
        .map_err(|_| ReleaseError::io("hash source tree", "timed out"))?
        .map_err(|e| ReleaseError::internal(format!("hash task failed: {e}")))??;

        Ok(SourceSnapshot {
            root: self.root.clone(),
            fingerprint: hashed.fingerprint(),
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// A git checkout fast-forwarded with `git pull --ff-only`.
///
/// The fingerprint is the resulting `HEAD` commit.
#[derive(Debug, Clone)]
pub struct GitSourceTree {
    root: PathBuf,
    timeout: Duration,
}

impl GitSourceTree {
    /// Creates a git source for the checkout at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root).args(args).kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ReleaseError::upstream(format!(
                    "git {} timed out after {}s",
                    args.join(" "),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ReleaseError::io("spawn git", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReleaseError::upstream(format!(
                "git {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceTree for GitSourceTree {
    async fn synchronize(&self) -> Result<SourceSnapshot> {
        self.git(&["pull", "--ff-only"]).await?;
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        tracing::info!(root = %self.root.display(), head = %head, "synchronized source checkout");
        Ok(SourceSnapshot {
            root: self.root.clone(),
            fingerprint: head,
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let source = LocalSourceTree::new(dir.path(), Duration::from_secs(5));

        let first = source.synchronize().await.unwrap();
        let same = source.synchronize().await.unwrap();
        assert_eq!(first, same);

        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        let changed = source.synchronize().await.unwrap();
        assert_ne!(first.fingerprint, changed.fingerprint);
    }

    #[tokio::test]
    async fn local_source_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalSourceTree::new(dir.path().join("missing"), Duration::from_secs(5));
        let err = source.synchronize().await.unwrap_err();
        assert!(matches!(err, ReleaseError::Io { .. }));
    }

    #[tokio::test]
    async fn git_pull_outside_a_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = GitSourceTree::new(dir.path(), Duration::from_secs(10));
        assert!(source.synchronize().await.is_err());
    }
}
