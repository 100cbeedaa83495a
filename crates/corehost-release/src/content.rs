//! Version file trees: materialization, content manifests, and verification.
//!
//! These functions are synchronous and touch only the filesystem, so they can
//! be tested against temporary directories. Async callers run them on the
//! blocking pool.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{ReleaseError, Result};
use crate::manifest::VersionStats;

/// Digest and size of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Hex-encoded SHA-256 of the file contents.
    pub hash: String,
    /// File size in bytes.
    pub size: u64,
}

/// Relative path to digest mapping for one version tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentManifest {
    /// Files keyed by `/`-separated path relative to the version root.
    pub files: BTreeMap<String, FileDigest>,
    /// Sum of all file sizes.
    pub total_size: u64,
    /// Number of files.
    pub file_count: u64,
}

impl ContentManifest {
    /// Registry stats for this tree. `instancesUsing` starts at zero.
    #[must_use]
    pub fn stats(&self) -> VersionStats {
        VersionStats {
            instances_using: 0,
            file_count: self.file_count,
            size: self.total_size,
        }
    }

    /// Digest over every `(path, hash)` pair, stable for identical trees.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, digest) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(digest.hash.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }

    fn insert(&mut self, path: String, digest: FileDigest) {
        self.total_size += digest.size;
        self.file_count += 1;
        self.files.insert(path, digest);
    }
}

/// Outcome of re-hashing a version tree against its content manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// Files checked.
    pub checked: u64,
    /// Listed files that are absent on disk.
    pub missing: Vec<String>,
    /// Listed files whose digest or size differs.
    pub mismatched: Vec<String>,
    /// Files on disk that are not listed.
    pub extra: Vec<String>,
}

impl IntegrityReport {
    /// True when the tree matches its manifest exactly.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.extra.is_empty()
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Hashes one file by streaming it through SHA-256.
///
/// # Errors
///
/// Returns the underlying io error if the file cannot be read.
pub fn hash_file(path: &Path) -> io::Result<FileDigest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok(FileDigest {
        hash: hex::encode(hasher.finalize()),
        size,
    })
}

/// Walks `root` and hashes every regular file beneath it.
///
/// Symlinks are not followed.
///
/// # Errors
///
/// Returns [`ReleaseError::Io`] if the walk or a read fails.
pub fn hash_tree(root: &Path) -> Result<ContentManifest> {
    let mut manifest = ContentManifest::default();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| ReleaseError::io(format!("walk {}", root.display()), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };
        let digest = hash_file(entry.path())
            .map_err(|e| ReleaseError::io(format!("hash {}", entry.path().display()), e))?;
        manifest.insert(key, digest);
    }
    Ok(manifest)
}

/// Copies every regular file under `source` into `dest`, creating `dest` if absent.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(ReleaseError::not_found(
            "source directory",
            source.display(),
        ));
    }
    fs::create_dir_all(dest)
        .map_err(|e| ReleaseError::io(format!("create {}", dest.display()), e))?;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| ReleaseError::io(format!("walk {}", source.display()), e))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| ReleaseError::io(format!("create {}", target.display()), e))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| {
                ReleaseError::io(
                    format!("copy {} to {}", entry.path().display(), target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Builds a fresh copy of `source` in `staging`, moves it to `dest`, and hashes the result.
///
/// Whatever was at `dest` before is replaced wholesale, so files that no
/// longer exist in `source` never survive into the new tree. `staging` must
/// be on the same filesystem as `dest`. The returned manifest describes
/// `dest`, so re-hashing it later reproduces the same digests.
///
/// # Errors
///
/// Returns [`ReleaseError::NotFound`] if `source` is not a directory, or
/// [`ReleaseError::Io`] if a copy, the move, or the hash fails.
pub fn materialize(source: &Path, staging: &Path, dest: &Path) -> Result<ContentManifest> {
    remove_dir_if_present(staging)?;
    if let Err(err) = copy_tree(source, staging) {
        let _ = fs::remove_dir_all(staging);
        return Err(err);
    }
    remove_dir_if_present(dest)?;
    fs::rename(staging, dest).map_err(|e| {
        ReleaseError::io(
            format!("move {} to {}", staging.display(), dest.display()),
            e,
        )
    })?;
    hash_tree(dest)
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ReleaseError::io(format!("remove {}", path.display()), e)),
    }
}

/// Re-hashes `root` and compares it with `expected`.
///
/// # Errors
///
/// Returns [`ReleaseError::Io`] if the tree cannot be walked. Unreadable
/// listed files are reported as mismatched rather than failing.
pub fn verify(root: &Path, expected: &ContentManifest) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();

    for (path, digest) in &expected.files {
        report.checked += 1;
        let file = root.join(path);
        if !file.is_file() {
            report.missing.push(path.clone());
            continue;
        }
        match hash_file(&file) {
            Ok(actual) if actual == *digest => {}
            _ => report.mismatched.push(path.clone()),
        }
    }

    if root.is_dir() {
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| ReleaseError::io(format!("walk {}", root.display()), e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(key) = relative_key(root, entry.path()) {
                if !expected.files.contains_key(&key) {
                    report.extra.push(key);
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn materialize_into(source: &Path, root: &Path, name: &str) -> Result<ContentManifest> {
        materialize(source, &root.join(format!(".staging-{name}")), &root.join(name))
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "lib/engine.js", "module.exports = 1;\n");
        write(dir.path(), "assets/js/core.js", "console.log('core');\n");
        write(dir.path(), "README.md", "core\n");
        dir
    }

    #[test]
    fn materialize_copies_and_describes_tree() {
        let source = source_tree();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("v1.0.1");

        let manifest = materialize_into(source.path(), dest.path(), "v1.0.1").unwrap();

        assert_eq!(manifest.file_count, 3);
        assert!(!dest.path().join(".staging-v1.0.1").exists());
        assert!(manifest.files.contains_key("assets/js/core.js"));
        assert_eq!(
            fs::read_to_string(target.join("lib/engine.js")).unwrap(),
            "module.exports = 1;\n"
        );
        let expected_size: u64 = manifest.files.values().map(|d| d.size).sum();
        assert_eq!(manifest.total_size, expected_size);
        assert_eq!(manifest.stats().file_count, 3);
    }

    #[test]
    fn rehashing_materialized_tree_reproduces_digests() {
        let source = source_tree();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("v1");
        let manifest = materialize_into(source.path(), dest.path(), "v1").unwrap();

        let again = hash_tree(&target).unwrap();
        assert_eq!(manifest, again);
        assert_eq!(manifest.fingerprint(), again.fingerprint());

        let report = verify(&target, &manifest).unwrap();
        assert!(report.is_intact());
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn verify_reports_missing_mismatched_and_extra() {
        let source = source_tree();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("v1");
        let manifest = materialize_into(source.path(), dest.path(), "v1").unwrap();

        fs::remove_file(target.join("README.md")).unwrap();
        fs::write(target.join("lib/engine.js"), "tampered").unwrap();
        write(&target, "lib/extra.js", "x");

        let report = verify(&target, &manifest).unwrap();
        assert_eq!(report.missing, vec!["README.md".to_string()]);
        assert_eq!(report.mismatched, vec!["lib/engine.js".to_string()]);
        assert_eq!(report.extra, vec!["lib/extra.js".to_string()]);
        assert!(!report.is_intact());
    }

    #[test]
    fn materialize_missing_source_is_not_found() {
        let dest = tempfile::tempdir().unwrap();
        let err = materialize_into(&dest.path().join("nope"), dest.path(), "out").unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
        assert!(!dest.path().join("out").exists());
        assert!(!dest.path().join(".staging-out").exists());
    }

    #[test]
    fn materialize_replaces_stale_tree() {
        let source = source_tree();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("v1.0.1");
        write(&target, "lib/removed_upstream.js", "old");
        write(&target, "README.md", "stale readme\n");
        write(dest.path(), ".staging-v1.0.1/leftover.txt", "from a crashed run");

        let manifest = materialize_into(source.path(), dest.path(), "v1.0.1").unwrap();

        assert_eq!(manifest.file_count, 3);
        assert!(!manifest.files.contains_key("lib/removed_upstream.js"));
        assert!(!manifest.files.contains_key("leftover.txt"));
        assert!(!target.join("lib/removed_upstream.js").exists());
        assert_eq!(fs::read_to_string(target.join("README.md")).unwrap(), "core\n");
        assert!(verify(&target, &manifest).unwrap().is_intact());
    }

    #[test]
    fn identical_trees_share_fingerprint() {
        let a = source_tree();
        let b = source_tree();
        assert_eq!(
            hash_tree(a.path()).unwrap().fingerprint(),
            hash_tree(b.path()).unwrap().fingerprint()
        );
    }
}
