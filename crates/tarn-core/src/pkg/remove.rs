//! Package removal.

use super::error::PkgError;
use super::install::ErrorInfo;
use super::link::remove_links_into;
use super::lockfile::LockfileManager;
use super::manifest::{read_manifest, write_manifest};
use super::spec::validate_package_name;
use crate::paths::{bin_dir, node_modules_dir};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a removal changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub name: String,
    pub path: PathBuf,
    pub manifest_updated: bool,
    pub lockfile_updated: bool,
    pub links_removed: usize,
    pub warnings: Vec<ErrorInfo>,
}

/// Remove `name` from the project's store, manifest and lockfile.
///
/// # Errors
/// `PKG_SPEC_INVALID` for a bad name, `PKG_MANIFEST_ERROR` if the manifest
/// cannot be read, `PKG_NOT_INSTALLED` if the package is not in the store
/// (nothing is changed in that case), `PKG_FILESYSTEM_ERROR` if the package
/// directory cannot be deleted.
pub fn remove_package(project_root: &Path, name: &str) -> Result<RemoveReport, PkgError> {
    validate_package_name(name)?;

    let mut manifest = read_manifest(project_root)?;
    let store = node_modules_dir(project_root);
    let package_dir = store.join(name);

    if fs::symlink_metadata(&package_dir).is_err() {
        return Err(PkgError::not_installed(name));
    }

    let links_removed = remove_links_into(&bin_dir(&store), &package_dir);

    fs::remove_dir_all(&package_dir).map_err(|e| {
        PkgError::filesystem(format!("Failed to remove {}: {e}", package_dir.display()))
    })?;
    debug!(path = %package_dir.display(), "Removed package directory");

    // Leave no empty scope directory behind
    if name.starts_with('@') {
        if let Some(scope_dir) = package_dir.parent() {
            let _ = fs::remove_dir(scope_dir);
        }
    }

    let mut warnings = Vec::new();

    let manifest_updated = manifest.remove_dependency(name);
    if manifest_updated {
        if let Err(e) = write_manifest(project_root, &manifest) {
            warn!(error = %e, "Failed to update manifest");
            warnings.push(ErrorInfo::from(&e));
        }
    }

    let lockfile_updated = match LockfileManager::open(project_root).and_then(|mut lockfile| {
        lockfile.remove(name)
    }) {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "Failed to update lockfile");
            warnings.push(ErrorInfo::from(&e));
            false
        }
    };

    info!(name, "Removed package");

    Ok(RemoveReport {
        name: name.to_string(),
        path: package_dir,
        manifest_updated,
        lockfile_updated,
        links_removed,
        warnings,
    })
}
