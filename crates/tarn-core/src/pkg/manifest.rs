//! `package.json` reading and dependency-section updates.
//!
//! The document is kept as an ordered JSON map so that writing it back
//! leaves unrelated fields and key order untouched.

use super::error::PkgError;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tarn_util::fs::atomic_write;
use tracing::warn;

/// Manifest filename.
pub const MANIFEST_NAME: &str = "package.json";

/// Which dependency section a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DepGroup {
    Dependencies,
    DevDependencies,
}

impl DepGroup {
    #[must_use]
    pub fn from_dev(is_dev: bool) -> Self {
        if is_dev {
            Self::DevDependencies
        } else {
            Self::Dependencies
        }
    }

    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Dependencies => "dependencies",
            Self::DevDependencies => "devDependencies",
        }
    }

    #[must_use]
    pub fn is_dev(self) -> bool {
        self == Self::DevDependencies
    }

    fn other(self) -> Self {
        match self {
            Self::Dependencies => Self::DevDependencies,
            Self::DevDependencies => Self::Dependencies,
        }
    }
}

/// A parsed `package.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    root: Map<String, Value>,
}

impl Manifest {
    /// Parse manifest JSON.
    ///
    /// # Errors
    /// `PKG_MANIFEST_ERROR` if the content is not a JSON object.
    pub fn parse(content: &str) -> Result<Self, PkgError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| PkgError::manifest(format!("Invalid {MANIFEST_NAME}: {e}")))?;
        match value {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(PkgError::manifest(format!(
                "{MANIFEST_NAME} must be a JSON object"
            ))),
        }
    }

    /// Package name, if the manifest declares one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.root.get("name").and_then(Value::as_str)
    }

    /// `dependencies` in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<(String, String)> {
        self.section(DepGroup::Dependencies)
    }

    /// `devDependencies` in declaration order.
    #[must_use]
    pub fn dev_dependencies(&self) -> Vec<(String, String)> {
        self.section(DepGroup::DevDependencies)
    }

    /// The entries of one dependency section. Non-string ranges are skipped
    /// with a warning.
    #[must_use]
    pub fn section(&self, group: DepGroup) -> Vec<(String, String)> {
        let Some(value) = self.root.get(group.key()) else {
            return Vec::new();
        };
        let Some(obj) = value.as_object() else {
            warn!(section = group.key(), "Ignoring non-object dependency section");
            return Vec::new();
        };

        obj.iter()
            .filter_map(|(name, range)| match range.as_str() {
                Some(range) => Some((name.clone(), range.to_string())),
                None => {
                    warn!(name, section = group.key(), "Ignoring non-string version range");
                    None
                }
            })
            .collect()
    }

    /// Record `name` at `version` in `group`, moving it out of the other
    /// group if it was there. Returns whether the document changed.
    pub fn set_dependency(&mut self, name: &str, version: &str, group: DepGroup) -> bool {
        let mut changed = false;
        if let Some(Value::Object(other)) = self.root.get_mut(group.other().key()) {
            changed |= other.shift_remove(name).is_some();
        }

        let section = self
            .root
            .entry(group.key())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(map) = section {
            if map.get(name).and_then(Value::as_str) != Some(version) {
                map.insert(name.to_string(), Value::String(version.to_string()));
                changed = true;
            }
        }
        changed
    }

    /// Remove `name` from both dependency groups. Returns whether it was
    /// present in either.
    pub fn remove_dependency(&mut self, name: &str) -> bool {
        let mut removed = false;
        for group in [DepGroup::Dependencies, DepGroup::DevDependencies] {
            if let Some(Value::Object(map)) = self.root.get_mut(group.key()) {
                removed |= map.shift_remove(name).is_some();
            }
        }
        removed
    }

    /// Pretty JSON with a trailing newline.
    ///
    /// # Errors
    /// `PKG_MANIFEST_ERROR` if serialization fails.
    pub fn to_json(&self) -> Result<String, PkgError> {
        let mut out = serde_json::to_string_pretty(&self.root)
            .map_err(|e| PkgError::manifest(format!("Failed to serialize manifest: {e}")))?;
        out.push('\n');
        Ok(out)
    }
}

/// Path of the manifest inside `project_root`.
#[must_use]
pub fn manifest_path(project_root: &Path) -> PathBuf {
    project_root.join(MANIFEST_NAME)
}

/// Read `<project_root>/package.json`.
///
/// # Errors
/// `PKG_MANIFEST_ERROR` if the file is missing, unreadable or not a JSON
/// object.
pub fn read_manifest(project_root: &Path) -> Result<Manifest, PkgError> {
    let path = manifest_path(project_root);
    let content = fs::read_to_string(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            PkgError::manifest(format!("{MANIFEST_NAME} not found in {}", project_root.display()))
        } else {
            PkgError::manifest(format!("Failed to read {}: {e}", path.display()))
        }
    })?;
    Manifest::parse(&content)
}

/// Write `<project_root>/package.json` atomically.
///
/// # Errors
/// `PKG_MANIFEST_ERROR` if the file cannot be written.
pub fn write_manifest(project_root: &Path, manifest: &Manifest) -> Result<(), PkgError> {
    let path = manifest_path(project_root);
    let content = manifest.to_json()?;
    atomic_write(&path, content.as_bytes())
        .map_err(|e| PkgError::manifest(format!("Failed to write {}: {e}", path.display())))
}
