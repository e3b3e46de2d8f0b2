//! YAML lockfile recording what each package name was asked for and what it
//! resolved to.
//!
//! ```yaml
//! lockfile_version: 1
//! packages:
//!   leftpad:
//!     version: ^1.0.0
//!     resolved: 1.3.0
//! ```
//!
//! Packages are kept in a `BTreeMap`, so the same set of entries always
//! serializes to the same bytes.

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tarn_util::fs::atomic_write;

/// Schema version for the lockfile format.
pub const LOCKFILE_SCHEMA_VERSION: u32 = 1;

/// Lockfile filename.
pub const LOCKFILE_NAME: &str = "tarn-lock.yaml";

/// One lockfile record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Version expression as requested.
    #[serde(rename = "version")]
    pub requested: String,
    /// Concrete version that was installed.
    pub resolved: String,
}

impl LockEntry {
    #[must_use]
    pub fn new(requested: impl Into<String>, resolved: impl Into<String>) -> Self {
        Self {
            requested: requested.into(),
            resolved: resolved.into(),
        }
    }
}

/// In-memory lockfile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub lockfile_version: u32,
    #[serde(default)]
    pub packages: BTreeMap<String, LockEntry>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self {
            lockfile_version: LOCKFILE_SCHEMA_VERSION,
            packages: BTreeMap::new(),
        }
    }
}

impl Lockfile {
    /// Parse lockfile YAML. Blank content is an empty lockfile.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_INVALID` if the YAML is invalid or the schema version
    /// is not supported.
    pub fn from_yaml(content: &str) -> Result<Self, PkgError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let lockfile: Self = serde_yaml::from_str(content)
            .map_err(|e| PkgError::lockfile_invalid(format!("Invalid lockfile YAML: {e}")))?;

        if lockfile.lockfile_version != LOCKFILE_SCHEMA_VERSION {
            return Err(PkgError::lockfile_invalid(format!(
                "Lockfile version {} not supported (expected {LOCKFILE_SCHEMA_VERSION})",
                lockfile.lockfile_version
            )));
        }

        Ok(lockfile)
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_WRITE_FAILED` if serialization fails.
    pub fn to_yaml(&self) -> Result<String, PkgError> {
        serde_yaml::to_string(self)
            .map_err(|e| PkgError::lockfile_write(format!("Failed to serialize lockfile: {e}")))
    }

    /// Read a lockfile, returning `None` if the file does not exist.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_INVALID` if the file exists but cannot be read or parsed.
    pub fn read_from(path: &Path) -> Result<Option<Self>, PkgError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PkgError::lockfile_invalid(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Write the lockfile atomically.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_WRITE_FAILED` if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<(), PkgError> {
        let content = self.to_yaml()?;
        atomic_write(path, content.as_bytes()).map_err(|e| {
            PkgError::lockfile_write(format!("Failed to write {}: {e}", path.display()))
        })
    }
}

/// Sole writer of a project's lockfile during a run.
///
/// Every mutation is written through to disk immediately. Callers that share
/// one manager between tasks wrap it in a mutex.
#[derive(Debug)]
pub struct LockfileManager {
    path: PathBuf,
    lockfile: Lockfile,
}

impl LockfileManager {
    /// Load the lockfile in `project_root`, or start an empty one in memory.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_INVALID` if an existing lockfile cannot be parsed.
    pub fn open(project_root: &Path) -> Result<Self, PkgError> {
        let path = project_root.join(LOCKFILE_NAME);
        let lockfile = Lockfile::read_from(&path)?.unwrap_or_default();
        Ok(Self { path, lockfile })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn lockfile(&self) -> &Lockfile {
        &self.lockfile
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.lockfile.packages.get(name)
    }

    /// Create the lockfile on disk if it is not there yet.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_WRITE_FAILED` if it cannot be created.
    pub fn ensure_lockfile_exists(&self) -> Result<(), PkgError> {
        if self.path.exists() {
            return Ok(());
        }
        self.lockfile.write_to(&self.path)
    }

    /// Insert or replace the entry for `name`.
    ///
    /// Skips the write when the entry is unchanged.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_WRITE_FAILED` if the file cannot be written; the
    /// in-memory record is updated regardless.
    pub fn record(&mut self, name: &str, entry: LockEntry) -> Result<(), PkgError> {
        if self.lockfile.packages.get(name) == Some(&entry) && self.path.exists() {
            return Ok(());
        }
        self.lockfile.packages.insert(name.to_string(), entry);
        self.lockfile.write_to(&self.path)
    }

    /// Drop the entry for `name`. Returns whether one existed.
    ///
    /// # Errors
    /// `PKG_LOCKFILE_WRITE_FAILED` if the file cannot be written.
    pub fn remove(&mut self, name: &str) -> Result<bool, PkgError> {
        if self.lockfile.packages.remove(name).is_none() {
            return Ok(false);
        }
        self.lockfile.write_to(&self.path)?;
        Ok(true)
    }
}
