use crate::error::Error;
use std::path::{Path, PathBuf};

/// Directory name of the package store inside a project.
pub const NODE_MODULES: &str = "node_modules";

/// Directory name holding executable shims inside a store.
pub const BIN_DIR: &str = ".bin";

/// Environment variable overriding the global install directory.
pub const GLOBAL_DIR_ENV: &str = "TARN_GLOBAL_DIR";

const GLOBAL_DIR_UNIX: &str = "/usr/local/lib/node_modules";
const GLOBAL_DIR_WINDOWS: &str = r"C:\Program Files\nodejs\node_modules";

/// Find the project root by walking up from `cwd` looking for `package.json`.
///
/// Returns the first directory containing the manifest, or `None`.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").is_file() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Like [`project_root`], but reports a missing manifest as an error.
pub fn require_project_root(cwd: &Path) -> Result<PathBuf, Error> {
    project_root(cwd).ok_or_else(|| Error::ProjectNotFound {
        start: cwd.to_path_buf(),
    })
}

/// The package store of a project: `<root>/node_modules`.
#[must_use]
pub fn node_modules_dir(project_root: &Path) -> PathBuf {
    project_root.join(NODE_MODULES)
}

/// The shim directory of a store: `<store>/.bin`.
#[must_use]
pub fn bin_dir(store_root: &Path) -> PathBuf {
    store_root.join(BIN_DIR)
}

/// Platform global install directory.
///
/// `TARN_GLOBAL_DIR` wins when set. Otherwise Windows hosts use the Node.js
/// program-files location and everything else the shared library directory.
#[must_use]
pub fn global_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(GLOBAL_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    default_global_dir(is_windows_host())
}

fn default_global_dir(windows: bool) -> PathBuf {
    if windows {
        PathBuf::from(GLOBAL_DIR_WINDOWS)
    } else {
        PathBuf::from(GLOBAL_DIR_UNIX)
    }
}

fn is_windows_host() -> bool {
    cfg!(windows)
        || std::env::var("OS")
            .map(|os| os.to_lowercase().starts_with("windows"))
            .unwrap_or(false)
}
