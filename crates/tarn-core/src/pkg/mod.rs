//! Package manager functionality.
//!
//! Provides utilities for:
//! - Parsing package specifications (name@version)
//! - Fetching package metadata from an npm-style registry
//! - Normalizing version expressions to registry queries
//! - Streaming tarball download and atomic extraction
//! - Publishing executables in `node_modules/.bin`
//! - Reading and updating `package.json` dependency sections
//! - The YAML lockfile
//! - Concurrent, deduplicated installation of a dependency graph
//! - Package removal

pub mod error;
pub mod install;
pub mod link;
pub mod lockfile;
pub mod manifest;
pub mod npmrc;
pub mod registry;
pub mod remove;
pub mod spec;
pub mod tarball;
pub mod version;

pub use error::{codes as pkg_codes, PkgError};
pub use install::{
    add_package, install_project, ArtifactSource, DependencyEdge, ErrorInfo, InstallOptions,
    InstallReport, InstallationKey, InstalledPackage, Installer, MetadataSource, PackageRequest,
    RootOutcome, RootStatus, SkippedPackage, VersionConflict,
};
pub use link::{publish_executables, remove_links_into};
pub use lockfile::{LockEntry, Lockfile, LockfileManager, LOCKFILE_NAME, LOCKFILE_SCHEMA_VERSION};
pub use manifest::{read_manifest, write_manifest, DepGroup, Manifest, MANIFEST_NAME};
pub use npmrc::NpmrcConfig;
pub use registry::{parse_metadata, RegistryClient, ResolvedPackage, DEFAULT_REGISTRY, REGISTRY_ENV};
pub use remove::{remove_package, RemoveReport};
pub use spec::{validate_package_name, PackageSpec};
pub use tarball::{extract_tgz_atomic, fetch_and_extract, ExtractSummary, MAX_TARBALL_SIZE};
pub use version::{normalize_version_expr, resolve_package, LATEST};
