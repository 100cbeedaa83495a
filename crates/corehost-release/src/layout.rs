//! On-disk layout of materialized versions.
//!
//! Each version lives in `<core_root>/versions/<version>/`, named exactly as
//! the version is spelled in the registry.

use std::path::{Component, Path, PathBuf};

use corehost_core::VersionId;

use crate::error::{ReleaseError, Result};

/// Checks that `relative` is a plain relative path with no `..` or root.
///
/// # Errors
///
/// Returns [`ReleaseError::Validation`] otherwise.
pub fn validate_relative(relative: &str) -> Result<&Path> {
    let requested = Path::new(relative);
    if relative.is_empty()
        || requested
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ReleaseError::validation("invalid file path"));
    }
    Ok(requested)
}

/// Locates version trees under the core root.
#[derive(Debug, Clone)]
pub struct VersionLayout {
    versions_root: PathBuf,
}

impl VersionLayout {
    /// Creates a layout for `core_root`.
    #[must_use]
    pub fn new(core_root: impl AsRef<Path>) -> Self {
        Self {
            versions_root: core_root.as_ref().join("versions"),
        }
    }

    /// Directory of one version tree.
    #[must_use]
    pub fn version_dir(&self, version: &VersionId) -> PathBuf {
        self.versions_root.join(version.as_str())
    }

    /// Scratch directory a version tree is built in before it is moved into place.
    ///
    /// The leading dot keeps it out of `resolve_file` lookups for real versions.
    #[must_use]
    pub fn staging_dir(&self, version: &VersionId) -> PathBuf {
        self.versions_root.join(format!(".staging-{}", version.as_str()))
    }

    /// Resolves `relative` inside the tree of `version`.
    ///
    /// Absolute paths, `..` components, and symlinks that lead outside the
    /// version root are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Validation`] for paths escaping the version
    /// root and [`ReleaseError::NotFound`] if the file does not exist.
    pub fn resolve_file(&self, version: &VersionId, relative: &str) -> Result<PathBuf> {
        let requested = validate_relative(relative)?;
        let root = self.version_dir(version);
        let candidate = root.join(requested);
        if !candidate.is_file() {
            return Err(ReleaseError::not_found("file", relative));
        }

        let canonical_root = root
            .canonicalize()
            .map_err(|e| ReleaseError::io(format!("resolve {}", root.display()), e))?;
        let canonical = candidate
            .canonicalize()
            .map_err(|e| ReleaseError::io(format!("resolve {}", candidate.display()), e))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(ReleaseError::validation("invalid file path"));
        }
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, VersionLayout, VersionId) {
        let dir = tempfile::tempdir().unwrap();
        let layout = VersionLayout::new(dir.path());
        let version: VersionId = "1.0.0".parse().unwrap();
        let tree = layout.version_dir(&version);
        std::fs::create_dir_all(tree.join("lib")).unwrap();
        std::fs::write(tree.join("lib/engine.js"), "engine").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        (dir, layout, version)
    }

    #[test]
    fn resolves_files_inside_the_version() {
        let (_dir, layout, version) = setup();
        let path = layout.resolve_file(&version, "lib/engine.js").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "engine");
    }

    #[test]
    fn traversal_is_a_validation_error() {
        let (_dir, layout, version) = setup();
        for bad in ["../../etc/passwd", "../../secret.txt", "/etc/passwd", "lib/../../x"] {
            let err = layout.resolve_file(&version, bad).unwrap_err();
            assert!(matches!(err, ReleaseError::Validation { .. }), "{bad}");
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, layout, version) = setup();
        let err = layout.resolve_file(&version, "lib/missing.js").unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_the_tree_is_rejected() {
        let (dir, layout, version) = setup();
        std::os::unix::fs::symlink(
            dir.path().join("secret.txt"),
            layout.version_dir(&version).join("link.txt"),
        )
        .unwrap();
        let err = layout.resolve_file(&version, "link.txt").unwrap_err();
        assert!(matches!(err, ReleaseError::Validation { .. }));
    }
}
