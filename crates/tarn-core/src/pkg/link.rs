//! Executable shims in `node_modules/.bin`.

use super::error::PkgError;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Publish a symlink in `bin_dir` for every declared executable.
///
/// Best effort: a failing link is logged and returned as a warning, never as
/// an error. An existing entry with the same command name is replaced.
pub fn publish_executables(
    install_path: &Path,
    executables: &[(String, String)],
    bin_dir: &Path,
) -> Vec<PkgError> {
    if executables.is_empty() {
        return Vec::new();
    }

    if let Err(e) = fs::create_dir_all(bin_dir) {
        let err = PkgError::link_failed(format!(
            "Failed to create {}: {e}",
            bin_dir.display()
        ));
        warn!(error = %err, "Skipping executables");
        return vec![err];
    }

    let install_path = absolutize(install_path);
    let mut warnings = Vec::new();

    for (command, entry) in executables {
        match publish_one(&install_path, command, entry, bin_dir) {
            Ok(link) => debug!(command, link = %link.display(), "Linked executable"),
            Err(err) => {
                warn!(command, error = %err, "Failed to link executable");
                warnings.push(err);
            }
        }
    }

    warnings
}

fn publish_one(
    install_path: &Path,
    command: &str,
    entry: &str,
    bin_dir: &Path,
) -> Result<PathBuf, PkgError> {
    if command.is_empty()
        || command.contains(['/', '\\'])
        || command == "."
        || command == ".."
    {
        return Err(PkgError::link_failed(format!(
            "Invalid command name '{command}'"
        )));
    }

    let target = install_path.join(entry_path(entry)?);
    let link = bin_dir.join(command);

    // Last writer wins
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link).map_err(|e| {
            PkgError::link_failed(format!("Failed to replace {}: {e}", link.display()))
        })?;
    }

    create_file_link(&target, &link).map_err(|e| {
        PkgError::link_failed(format!(
            "Failed to link {} -> {}: {e}",
            link.display(),
            target.display()
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Only files that really live inside the package get the exec bit
        let contained = match (fs::canonicalize(&target), fs::canonicalize(install_path)) {
            (Ok(real), Ok(root)) => real.starts_with(root),
            _ => false,
        };
        if contained {
            if let Ok(meta) = fs::metadata(&target) {
                let mode = meta.permissions().mode();
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o111));
            }
        }
    }

    Ok(link)
}

/// A `bin` entry as a path relative to the package directory.
///
/// # Errors
/// `PKG_LINK_FAILED` for an empty entry or one that is absolute or climbs
/// out with `..`.
fn entry_path(entry: &str) -> Result<PathBuf, PkgError> {
    let mut clean = PathBuf::new();
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PkgError::link_failed(format!(
                    "Executable '{entry}' points outside the package"
                )));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(PkgError::link_failed(format!(
            "Executable '{entry}' does not name a file"
        )));
    }
    Ok(clean)
}

/// Remove every shim in `bin_dir` that points into `package_dir`.
///
/// Returns the number of links removed.
pub fn remove_links_into(bin_dir: &Path, package_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(bin_dir) else {
        return 0;
    };
    let package_dir = absolutize(package_dir);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(target) = fs::read_link(&path) else {
            continue;
        };
        let target = if target.is_absolute() {
            target
        } else {
            bin_dir.join(target)
        };
        if target.starts_with(&package_dir) && fs::remove_file(&path).is_ok() {
            debug!(link = %path.display(), "Removed executable link");
            removed += 1;
        }
    }

    removed
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn create_file_link(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, link)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (target, link);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }
}
