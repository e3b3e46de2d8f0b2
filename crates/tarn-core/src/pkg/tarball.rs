//! Streaming tarball download and atomic extraction.
//!
//! The HTTP body is piped through gzip and tar decoding as it arrives; the
//! archive is never held in memory as a whole. Entries land in a hidden
//! staging directory next to the destination, which is renamed into place
//! only after the last entry has been written.

use super::error::PkgError;
use super::registry::RegistryClient;
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tarn_util::fs::{replace_dir, temp_sibling};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Wrapper directory npm-style registries put around package contents.
const PACKAGE_PREFIX: &str = "package/";

/// What an extraction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractSummary {
    /// Regular files written.
    pub files: u64,
    /// Total bytes of file content written.
    pub bytes: u64,
    /// BLAKE3 digest over every extracted path and its content, in archive order.
    pub digest: String,
}

/// Download `tarball_url` and extract it to `destination_root/package_name`.
///
/// # Errors
/// `PKG_NETWORK_ERROR` for transport failures (including a body cut short),
/// `PKG_DECOMPRESSION_FAILED` for corrupt gzip/tar data,
/// `PKG_FILESYSTEM_ERROR` for local write failures. On any error nothing is
/// left at the destination that was not there before.
pub async fn fetch_and_extract(
    registry: &RegistryClient,
    tarball_url: &str,
    package_name: &str,
    destination_root: &Path,
) -> Result<ExtractSummary, PkgError> {
    let response = registry
        .get(tarball_url)
        .timeout(registry.download_timeout())
        .send()
        .await
        .map_err(|e| PkgError::network(format!("Failed to download '{tarball_url}': {e}")))?;

    if !response.status().is_success() {
        return Err(PkgError::network(format!(
            "Download failed with status {} for '{tarball_url}'",
            response.status()
        )));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_TARBALL_SIZE {
            return Err(PkgError::network(format!(
                "Tarball too large: {len} bytes (max: {MAX_TARBALL_SIZE})"
            )));
        }
    }

    let stream = response.bytes_stream().map_err(io::Error::other);
    let reader = SyncIoBridge::new(StreamReader::new(stream));
    let dest = destination_root.join(package_name);

    debug!(url = %tarball_url, dest = %dest.display(), "Streaming tarball");

    tokio::task::spawn_blocking(move || extract_tgz_atomic(reader.take(MAX_TARBALL_SIZE), &dest))
        .await
        .map_err(|e| PkgError::filesystem(format!("Extraction task failed: {e}")))?
}

/// Extract a gzip-compressed tar stream into `dest` atomically.
///
/// A leading `package/` segment is stripped from every entry; entries that
/// reduce to nothing are the wrapper directory itself and are skipped.
///
/// # Errors
/// See [`fetch_and_extract`].
pub fn extract_tgz_atomic<R: Read>(reader: R, dest: &Path) -> Result<ExtractSummary, PkgError> {
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::filesystem("Destination has no parent"))?;
    fs::create_dir_all(parent).map_err(|e| {
        PkgError::filesystem(format!("Failed to create {}: {e}", parent.display()))
    })?;

    let staging = temp_sibling(dest, "extract");
    fs::create_dir_all(&staging).map_err(|e| {
        PkgError::filesystem(format!("Failed to create staging directory: {e}"))
    })?;

    let summary = match extract_entries(reader, &staging) {
        Ok(summary) => summary,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if let Err(e) = replace_dir(&staging, dest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(PkgError::filesystem(format!(
            "Failed to move package into {}: {e}",
            dest.display()
        )));
    }

    Ok(summary)
}

/// Map an archive entry name to its path relative to the package root.
///
/// Returns `None` for entries that should be skipped.
#[must_use]
pub fn strip_package_prefix(entry_name: &str) -> Option<&str> {
    let relative = match entry_name.strip_prefix(PACKAGE_PREFIX) {
        Some(rest) => rest,
        None => entry_name,
    };

    if relative.trim_matches('/').is_empty() {
        None
    } else {
        Some(relative)
    }
}

fn extract_entries<R: Read>(reader: R, staging: &Path) -> Result<ExtractSummary, PkgError> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut hasher = blake3::Hasher::new();
    let mut summary = ExtractSummary::default();
    let mut buffer = vec![0u8; 64 * 1024];

    let entries = archive.entries().map_err(read_error)?;
    for entry in entries {
        let mut entry = entry.map_err(read_error)?;

        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(relative) = strip_package_prefix(&raw_name) else {
            continue;
        };
        let relative = sanitize(relative)?;
        let target = staging.join(&relative);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target).map_err(write_error)?;
            continue;
        }
        if !entry_type.is_file() {
            // Symlinks and special entries are not materialized
            debug!(entry = %raw_name, "Skipping non-regular tar entry");
            continue;
        }

        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(write_error)?;
        }

        let mut file = File::create(&target).map_err(write_error)?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        loop {
            let n = entry.read(&mut buffer).map_err(read_error)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).map_err(write_error)?;
            hasher.update(&buffer[..n]);
            summary.bytes += n as u64;
        }
        summary.files += 1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(mode) = entry.header().mode() {
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777));
            }
        }
    }

    summary.digest = hasher.finalize().to_hex().to_string();
    Ok(summary)
}

/// Reject absolute paths and `..` traversal.
fn sanitize(relative: &str) -> Result<PathBuf, PkgError> {
    let path = Path::new(relative);
    let mut clean = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PkgError::decompression(format!(
                    "Tarball entry escapes package directory: {relative}"
                )));
            }
        }
    }

    Ok(clean)
}

/// Errors while pulling bytes out of the archive: either the body stream
/// broke (network) or the data is not a valid gzip/tar stream.
fn read_error(e: io::Error) -> PkgError {
    let from_network = e
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<reqwest::Error>().is_some());
    if from_network {
        PkgError::network(format!("Tarball download interrupted: {e}"))
    } else {
        PkgError::decompression(format!("Corrupt tarball: {e}"))
    }
}

fn write_error(e: io::Error) -> PkgError {
    PkgError::filesystem(format!("Failed to write package file: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, EntryType, Header};
    use tempfile::tempdir;

    fn append_file(builder: &mut Builder<&mut Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn append_dir(builder: &mut Builder<&mut Vec<u8>>, path: &str) {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();
    }

    fn gzip(tar_bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn create_test_tarball() -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            append_dir(&mut builder, "package/");
            append_file(
                &mut builder,
                "package/package.json",
                br#"{"name":"leftpad","version":"1.3.0"}"#,
            );
            append_file(&mut builder, "package/lib/index.js", b"module.exports = 42;");
            builder.finish().unwrap();
        }
        gzip(&tar_bytes)
    }

    #[test]
    fn test_strip_package_prefix() {
        assert_eq!(strip_package_prefix("package/lib/index.js"), Some("lib/index.js"));
        assert_eq!(strip_package_prefix("package/"), None);
        assert_eq!(strip_package_prefix("package"), Some("package"));
        assert_eq!(strip_package_prefix("other/index.js"), Some("other/index.js"));
    }

    #[test]
    fn test_extract_strips_wrapper() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("node_modules").join("leftpad");

        let summary = extract_tgz_atomic(&create_test_tarball()[..], &dest).unwrap();

        assert!(dest.join("package.json").exists());
        assert_eq!(
            fs::read_to_string(dest.join("lib/index.js")).unwrap(),
            "module.exports = 42;"
        );
        assert!(!dest.join("package").exists());
        assert_eq!(summary.files, 2);
        assert!(!summary.digest.is_empty());
    }

    #[test]
    fn test_bare_package_entry_not_stripped() {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            append_file(&mut builder, "package", b"plain file");
            builder.finish().unwrap();
        }

        let dir = tempdir().unwrap();
        let dest = dir.path().join("odd");
        extract_tgz_atomic(&gzip(&tar_bytes)[..], &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("package")).unwrap(), "plain file");
    }

    #[test]
    fn test_reextract_replaces_tree() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("leftpad");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.js"), "old").unwrap();

        let first = extract_tgz_atomic(&create_test_tarball()[..], &dest).unwrap();
        let second = extract_tgz_atomic(&create_test_tarball()[..], &dest).unwrap();

        assert!(!dest.join("stale.js").exists());
        assert_eq!(first.digest, second.digest);
        assert_eq!(
            tarn_util::hash::blake3_tree(&dest).unwrap(),
            {
                let again = dir.path().join("again");
                extract_tgz_atomic(&create_test_tarball()[..], &again).unwrap();
                tarn_util::hash::blake3_tree(&again).unwrap()
            }
        );
    }

    #[test]
    fn test_truncated_stream_leaves_nothing_behind() {
        let tgz = create_test_tarball();
        let truncated = &tgz[..tgz.len() / 2];

        let dir = tempdir().unwrap();
        let dest = dir.path().join("leftpad");

        let err = extract_tgz_atomic(truncated, &dest).unwrap_err();
        assert_eq!(err.code(), codes::PKG_DECOMPRESSION_FAILED);
        assert!(!dest.exists());

        // Staging directory is cleaned up too
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_truncated_stream_keeps_previous_install() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("leftpad");
        extract_tgz_atomic(&create_test_tarball()[..], &dest).unwrap();

        let tgz = create_test_tarball();
        assert!(extract_tgz_atomic(&tgz[..tgz.len() / 2], &dest).is_err());

        assert!(dest.join("lib/index.js").exists());
    }

    #[test]
    fn test_not_gzip_is_decompression_error() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x");
        let err = extract_tgz_atomic(&b"definitely not gzip"[..], &dest).unwrap_err();
        assert_eq!(err.code(), codes::PKG_DECOMPRESSION_FAILED);
        assert!(!dest.exists());
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize("../escape.js").is_err());
        assert!(sanitize("lib/../../escape.js").is_err());
        assert!(sanitize("/etc/passwd").is_err());
        assert_eq!(sanitize("./lib/a.js").unwrap(), PathBuf::from("lib/a.js"));
    }

    #[test]
    fn test_scoped_destination_creates_scope_dir() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("@types").join("node");
        extract_tgz_atomic(&create_test_tarball()[..], &dest).unwrap();
        assert!(dest.join("package.json").exists());
    }
}
