//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    pub const PKG_NETWORK_ERROR: &str = "PKG_NETWORK_ERROR";
    pub const PKG_MALFORMED_RESPONSE: &str = "PKG_MALFORMED_RESPONSE";
    pub const PKG_MISSING_FIELD: &str = "PKG_MISSING_FIELD";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_DECOMPRESSION_FAILED: &str = "PKG_DECOMPRESSION_FAILED";
    pub const PKG_FILESYSTEM_ERROR: &str = "PKG_FILESYSTEM_ERROR";
    pub const PKG_MANIFEST_ERROR: &str = "PKG_MANIFEST_ERROR";
    pub const PKG_LOCKFILE_WRITE_FAILED: &str = "PKG_LOCKFILE_WRITE_FAILED";
    pub const PKG_LOCKFILE_INVALID: &str = "PKG_LOCKFILE_INVALID";
    pub const PKG_NOT_INSTALLED: &str = "PKG_NOT_INSTALLED";
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_LINK_FAILED: &str = "PKG_LINK_FAILED";
}

/// Package manager error.
///
/// Cloneable so a single fetch outcome can be handed to every branch of the
/// dependency graph waiting on the same package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Connection failure, timeout, or non-success HTTP status.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_NETWORK_ERROR, msg)
    }

    /// Registry body is not the JSON document we expect.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_MALFORMED_RESPONSE, msg)
    }

    /// A required metadata field is absent.
    #[must_use]
    pub fn missing_field(name: &str, field: &str) -> Self {
        Self::new(
            codes::PKG_MISSING_FIELD,
            format!("Registry metadata for '{name}' is missing '{field}'"),
        )
    }

    /// The registry does not know this package/version.
    #[must_use]
    pub fn not_found(name: &str, version: &str) -> Self {
        Self::new(
            codes::PKG_NOT_FOUND,
            format!("Package not found: {name}@{version}"),
        )
    }

    /// Corrupt gzip or tar stream.
    pub fn decompression(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_DECOMPRESSION_FAILED, msg)
    }

    /// Disk full, permission denied, failed rename.
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_FILESYSTEM_ERROR, msg)
    }

    /// Missing or unparsable manifest.
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_MANIFEST_ERROR, msg)
    }

    /// The lockfile could not be written.
    pub fn lockfile_write(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LOCKFILE_WRITE_FAILED, msg)
    }

    /// The existing lockfile cannot be read or parsed.
    pub fn lockfile_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LOCKFILE_INVALID, msg)
    }

    /// Removal of a package that is not in the store.
    #[must_use]
    pub fn not_installed(name: &str) -> Self {
        Self::new(
            codes::PKG_NOT_INSTALLED,
            format!("Package {name} is not installed"),
        )
    }

    /// Bad `name@version` argument.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// A bin shim could not be created.
    pub fn link_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LINK_FAILED, msg)
    }

    /// Whether a caller-side retry policy may try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code == codes::PKG_NETWORK_ERROR
    }

    /// Whether the package should be skipped with a warning while the run
    /// carries on.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self.code,
            codes::PKG_MALFORMED_RESPONSE | codes::PKG_MISSING_FIELD | codes::PKG_NOT_FOUND
        )
    }

    /// Whether this aborts installation of the package (and its subtree).
    #[must_use]
    pub fn is_fatal_to_package(&self) -> bool {
        matches!(
            self.code,
            codes::PKG_NETWORK_ERROR
                | codes::PKG_DECOMPRESSION_FAILED
                | codes::PKG_FILESYSTEM_ERROR
                | codes::PKG_SPEC_INVALID
        )
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::filesystem(e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::network(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::network(format!("Connection failed: {e}"))
        } else {
            Self::network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed(format!("Invalid JSON: {e}"))
    }
}
