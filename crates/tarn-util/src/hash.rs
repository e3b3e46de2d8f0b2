use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Compute a BLAKE3 digest over an entire directory tree.
///
/// Entries are visited in sorted order and both the relative path and the
/// file content feed the hash, so two trees hash equal only if they contain
/// the same files with the same bytes. Symlinks contribute their target path.
///
/// # Errors
/// Returns an error if the tree cannot be walked or a file cannot be read.
pub fn blake3_tree(root: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let file_type = entry.file_type();

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(&[0]);

        if file_type.is_file() {
            let mut reader = BufReader::new(File::open(entry.path())?);
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        }
        hasher.update(&[0xff]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
