//! Pre-built fixtures for filesystem and registry tests.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tempfile::TempDir;

/// Folder inside a source checkout that holds one folder per version.
pub const SOURCE_VERSIONS_DIR: &str = "core/versions";

/// A temporary source checkout laid out as `core/versions/<version>/...`.
#[derive(Debug)]
pub struct SourceFixture {
    dir: TempDir,
}

impl SourceFixture {
    /// Creates an empty checkout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create source tempdir"),
        }
    }

    /// Adds a version folder with the given `(relative path, contents)` files.
    #[must_use]
    pub fn with_version(self, version: &str, files: &[(&str, &str)]) -> Self {
        self.add_version(version, files);
        self
    }

    /// Adds a version folder and returns its path.
    pub fn add_version(&self, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.root().join(SOURCE_VERSIONS_DIR).join(version);
        fs::create_dir_all(&root).expect("create version folder");
        for (relative, contents) in files {
            write_file(&root, relative, contents);
        }
        root
    }

    /// Root of the checkout.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for SourceFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `contents` to `root/relative`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(&path, contents).expect("write fixture file");
}

/// Builds a registry document with `versions` newest first and `latest`
/// marked as such.
#[must_use]
pub fn manifest_json(latest: &str, versions: &[&str]) -> Value {
    let entries: Vec<Value> = versions
        .iter()
        .rev()
        .map(|version| {
            json!({
                "version": version,
                "description": format!("Release {version}"),
                "status": if *version == latest { "latest" } else { "stable" },
                "releaseDate": "2024-01-15",
                "stats": { "instancesUsing": 0, "fileCount": 0, "size": 0 }
            })
        })
        .collect();
    json!({ "latest": latest, "versions": entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_fixture_lays_out_versions() {
        let source = SourceFixture::new().with_version("v1.2.0", &[("lib/a.js", "a")]);
        let file = source.root().join("core/versions/v1.2.0/lib/a.js");
        assert_eq!(fs::read_to_string(file).unwrap(), "a");
    }

    #[test]
    fn manifest_json_orders_newest_first() {
        let doc = manifest_json("v1.1.0", &["v1.0.0", "v1.1.0"]);
        assert_eq!(doc["versions"][0]["version"], "v1.1.0");
        assert_eq!(doc["versions"][0]["status"], "latest");
        assert_eq!(doc["versions"][1]["status"], "stable");
    }
}
