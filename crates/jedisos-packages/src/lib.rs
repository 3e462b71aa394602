//! Scans, installs, validates, and removes on-disk packages under a typed
//! directory layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const ALLOWED_LICENSES: &[&str] = &["MIT", "Apache-2.0", "BSD-3-Clause"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    Skills,
    McpServers,
    Prompts,
    Workflows,
    Identities,
    Bundles,
}

impl PackageType {
    pub fn dir_name(self) -> &'static str {
        match self {
            PackageType::Skills => "skills",
            PackageType::McpServers => "mcp-servers",
            PackageType::Prompts => "prompts",
            PackageType::Workflows => "workflows",
            PackageType::Identities => "identities",
            PackageType::Bundles => "bundles",
        }
    }

    pub fn all() -> [PackageType; 6] {
        [
            PackageType::Skills,
            PackageType::McpServers,
            PackageType::Prompts,
            PackageType::Workflows,
            PackageType::Identities,
            PackageType::Bundles,
        ]
    }
}

/// Deserialized `jedisos-package.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    pub license: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// What `scan`/`search`/`get` return: metadata plus where it lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub metadata: PackageMetadata,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("package '{0}' already exists; pass force=true to replace it")]
    AlreadyExists(String),
    #[error("package '{0}' not found")]
    NotFound(String),
    #[error("package metadata invalid: {0}")]
    InvalidMetadata(String),
    #[error("license '{0}' is not in the allowed set {1:?}")]
    DisallowedLicense(String, &'static [&'static str]),
}

fn io_err(path: &Path, source: std::io::Error) -> PackageError {
    PackageError::Io { path: path.display().to_string(), source }
}

pub const METADATA_FILE: &str = "jedisos-package.yaml";

/// Subdirectory forge-authored skills install under, nested one level below
/// the typed `skills/` directory so they're distinguishable at a glance from
/// skills a user installed directly.
pub const GENERATED_SUBDIR: &str = "generated";

pub struct PackageManager {
    root: PathBuf,
}

impl PackageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn type_dir(&self, package_type: PackageType) -> PathBuf {
        self.root.join(package_type.dir_name())
    }

    /// Every directory `scan` walks for a given package type: the typed
    /// directory itself, plus its `generated/` subdirectory for skills.
    fn scan_dirs(&self, package_type: PackageType) -> Vec<PathBuf> {
        let base = self.type_dir(package_type);
        if package_type == PackageType::Skills {
            vec![base.clone(), base.join(GENERATED_SUBDIR)]
        } else {
            vec![base]
        }
    }

    fn read_metadata(dir: &Path) -> Result<PackageMetadata, PackageError> {
        let metadata_path = dir.join(METADATA_FILE);
        let raw = std::fs::read_to_string(&metadata_path).map_err(|e| io_err(&metadata_path, e))?;
        let metadata: PackageMetadata = serde_yaml::from_str(&raw)
            .map_err(|e| PackageError::InvalidMetadata(e.to_string()))?;
        if !ALLOWED_LICENSES.contains(&metadata.license.as_str()) {
            return Err(PackageError::DisallowedLicense(metadata.license.clone(), ALLOWED_LICENSES));
        }
        Ok(metadata)
    }

    /// Walks each typed subdirectory, skipping any child whose metadata
    /// fails to parse (logged, not fatal). Returns the list sorted by name.
    pub fn scan(&self) -> Vec<PackageInfo> {
        let mut found = Vec::new();
        for package_type in PackageType::all() {
            for dir in self.scan_dirs(package_type) {
                let Ok(entries) = std::fs::read_dir(&dir) else { continue };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    match Self::read_metadata(&path) {
                        Ok(metadata) => found.push(PackageInfo { metadata, path }),
                        Err(err) => warn!(path = %path.display(), error = %err, "skipping package with invalid metadata"),
                    }
                }
            }
        }
        found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        found
    }

    pub fn search(&self, query: &str, package_type: Option<PackageType>) -> Vec<PackageInfo> {
        let query = query.to_lowercase();
        self.scan()
            .into_iter()
            .filter(|info| package_type.is_none_or(|t| t == info.metadata.package_type))
            .filter(|info| {
                info.metadata.name.to_lowercase().contains(&query)
                    || info.metadata.description.to_lowercase().contains(&query)
                    || info.metadata.tags.iter().any(|tag| tag.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<PackageInfo> {
        self.scan().into_iter().find(|info| info.metadata.name == name)
    }

    /// Copies `source_dir` under the typed parent derived from its metadata.
    /// Atomic: on any failure partway through the copy, the target is
    /// removed before the error propagates, leaving the target directory
    /// either absent or in its pre-install state.
    pub fn install(&self, source_dir: &Path, force: bool) -> Result<PackageInfo, PackageError> {
        self.install_at(source_dir, force, false)
    }

    /// Like `install`, but nests the target one level further under the
    /// typed directory's `generated/` subdirectory — for skills the forge
    /// authors at runtime rather than a user installing from the market.
    pub fn install_generated(&self, source_dir: &Path, force: bool) -> Result<PackageInfo, PackageError> {
        self.install_at(source_dir, force, true)
    }

    fn install_at(&self, source_dir: &Path, force: bool, generated: bool) -> Result<PackageInfo, PackageError> {
        let metadata = Self::read_metadata(source_dir)?;
        let mut parent_dir = self.type_dir(metadata.package_type);
        if generated {
            parent_dir = parent_dir.join(GENERATED_SUBDIR);
        }
        let target_dir = parent_dir.join(&metadata.name);

        if target_dir.exists() {
            if !force {
                return Err(PackageError::AlreadyExists(metadata.name));
            }
            std::fs::remove_dir_all(&target_dir).map_err(|e| io_err(&target_dir, e))?;
        }

        if let Some(parent) = target_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        if let Err(err) = copy_dir_recursive(source_dir, &target_dir) {
            let _ = std::fs::remove_dir_all(&target_dir);
            return Err(err);
        }

        Ok(PackageInfo { metadata, path: target_dir })
    }

    pub fn remove(&self, name: &str) -> Result<(), PackageError> {
        let info = self.get(name).ok_or_else(|| PackageError::NotFound(name.to_string()))?;
        std::fs::remove_dir_all(&info.path).map_err(|e| io_err(&info.path, e))
    }
}

fn copy_dir_recursive(source: &Path, target: &Path) -> Result<(), PackageError> {
    std::fs::create_dir_all(target).map_err(|e| io_err(target, e))?;
    for entry in std::fs::read_dir(source).map_err(|e| io_err(source, e))? {
        let entry = entry.map_err(|e| io_err(source, e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_package(dir: &Path, name: &str, license: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let mut file = std::fs::File::create(dir.join(METADATA_FILE)).unwrap();
        writeln!(
            file,
            "name: {name}\nversion: \"0.1.0\"\ndescription: a test package\ntype: skills\nlicense: {license}\ntags: [weather]\n"
        )
        .unwrap();
    }

    #[test]
    fn scan_finds_installed_packages() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&src, false).unwrap();

        let scanned = mgr.scan();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].metadata.name, "weather");
    }

    #[test]
    fn install_then_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&src, false).unwrap();
        assert!(mgr.get("weather").is_some());

        mgr.remove("weather").unwrap();
        assert!(mgr.get("weather").is_none());
    }

    #[test]
    fn install_without_force_over_existing_fails_without_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&src, false).unwrap();
        let before = mgr.get("weather").unwrap().metadata.version;

        let err = mgr.install(&src, false).unwrap_err();
        assert!(matches!(err, PackageError::AlreadyExists(_)));
        assert_eq!(mgr.get("weather").unwrap().metadata.version, before);
    }

    #[test]
    fn force_install_replaces_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&src, false).unwrap();
        mgr.install(&src, true).unwrap();
        assert_eq!(mgr.scan().len(), 1);
    }

    #[test]
    fn disallowed_license_is_skipped_with_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "GPL-3.0");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        let err = mgr.install(&src, false).unwrap_err();
        assert!(matches!(err, PackageError::DisallowedLicense(_, _)));
    }

    #[test]
    fn scan_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&src, false).unwrap();

        let first: Vec<String> = mgr.scan().into_iter().map(|p| p.metadata.name).collect();
        let second: Vec<String> = mgr.scan().into_iter().map(|p| p.metadata.name).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn remove_unknown_package_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = PackageManager::new(tmp.path().join("tools"));
        let err = mgr.remove("nope").unwrap_err();
        assert!(matches!(err, PackageError::NotFound(_)));
    }

    #[test]
    fn install_generated_lands_under_skills_generated() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("scratch-weather");
        write_package(&src, "weather", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        let info = mgr.install_generated(&src, false).unwrap();

        assert_eq!(info.path, tmp.path().join("tools/skills/generated/weather"));
        assert_eq!(mgr.get("weather").unwrap().path, info.path);
    }

    #[test]
    fn scan_finds_both_direct_and_generated_skills() {
        let tmp = tempfile::tempdir().unwrap();
        let direct_src = tmp.path().join("src-sunrise");
        write_package(&direct_src, "sunrise", "MIT");
        let generated_src = tmp.path().join("src-sunset");
        write_package(&generated_src, "sunset", "MIT");

        let mgr = PackageManager::new(tmp.path().join("tools"));
        mgr.install(&direct_src, false).unwrap();
        mgr.install_generated(&generated_src, false).unwrap();

        let names: Vec<String> = mgr.scan().into_iter().map(|p| p.metadata.name).collect();
        assert_eq!(names, vec!["sunrise".to_string(), "sunset".to_string()]);
    }
}
