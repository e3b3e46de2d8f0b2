use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a hidden sibling path for `path` that is unique within this process.
///
/// The returned path lives in the same directory as `path`, so a later
/// `rename` onto `path` never crosses a filesystem boundary.
#[must_use]
pub fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".{name}.{tag}.{}.{n}", std::process::id()))
}

/// Atomically write bytes to a file by writing to a temp file then renaming.
///
/// The file will either have the old contents or the new contents, never a
/// partial write.
///
/// # Errors
/// Returns an error if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = temp_sibling(path, "tmp");

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // On Windows, rename can fail if target exists.
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Move a fully populated directory `src` to `dest`, replacing whatever is there.
///
/// An existing `dest` is first renamed aside, so readers see either the old
/// tree or the new tree. If the final rename fails the old tree is put back.
///
/// Failing to delete the renamed-aside tree afterwards is not an error.
///
/// # Errors
/// Returns an error if either rename fails.
pub fn replace_dir(src: &Path, dest: &Path) -> io::Result<()> {
    let backup = if fs::symlink_metadata(dest).is_ok() {
        let backup = temp_sibling(dest, "old");
        fs::rename(dest, &backup)?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = fs::rename(src, dest) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, dest);
        }
        return Err(e);
    }

    // The new tree is already in place; a stale backup is only clutter.
    if let Some(backup) = backup {
        let _ = remove_any(&backup);
    }

    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
