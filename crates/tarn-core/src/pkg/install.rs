//! Recursive, concurrent package installation.
//!
//! Roots are resolved first and claim their package names before any
//! transitive work begins. Each claimed name owns a once-cell holding the
//! fetch outcome: whoever initializes the cell performs the download and
//! then links, records and descends into the package's dependencies, while
//! every other branch that reaches the same `(name, version)` just awaits
//! the cell. A different version of an already claimed name is a conflict
//! and is neither fetched nor traversed.
//!
//! Network and extraction work is bounded by a shared semaphore.
//!
//! Each root carries a cancellation token. A fatal error stops that root
//! from starting new resolutions, but a fetch that has begun always runs
//! to completion. When a cancelled root leaves a shared package with
//! unvisited children, the first healthy root that reaches the package
//! visits them before the run reports. A root whose closure contains a
//! failed subtree is reported as failed.

use super::error::PkgError;
use super::link::publish_executables;
use super::lockfile::{LockEntry, LockfileManager};
use super::manifest::{read_manifest, write_manifest, DepGroup, Manifest};
use super::registry::{RegistryClient, ResolvedPackage};
use super::spec::{validate_package_name, PackageSpec};
use super::tarball::{fetch_and_extract, ExtractSummary};
use super::version::resolve_package;
use crate::paths::{bin_dir, node_modules_dir};
use futures::future::{join_all, BoxFuture};
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves a name and version expression to one published version.
pub trait MetadataSource: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        version_expr: &str,
    ) -> impl Future<Output = Result<ResolvedPackage, PkgError>> + Send;
}

/// Downloads and unpacks a package into `destination_root/name`.
pub trait ArtifactSource: Send + Sync {
    fn fetch_and_extract(
        &self,
        tarball_url: &str,
        name: &str,
        destination_root: &Path,
    ) -> impl Future<Output = Result<ExtractSummary, PkgError>> + Send;
}

impl MetadataSource for RegistryClient {
    fn resolve(
        &self,
        name: &str,
        version_expr: &str,
    ) -> impl Future<Output = Result<ResolvedPackage, PkgError>> + Send {
        resolve_package(self, name, version_expr)
    }
}

impl ArtifactSource for RegistryClient {
    fn fetch_and_extract(
        &self,
        tarball_url: &str,
        name: &str,
        destination_root: &Path,
    ) -> impl Future<Output = Result<ExtractSummary, PkgError>> + Send {
        fetch_and_extract(self, tarball_url, name, destination_root)
    }
}

/// One package to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub name: String,
    pub version_expr: String,
    pub is_dev: bool,
    pub is_transitive: bool,
}

impl PackageRequest {
    #[must_use]
    pub fn root(name: impl Into<String>, version_expr: impl Into<String>, is_dev: bool) -> Self {
        Self {
            name: name.into(),
            version_expr: version_expr.into(),
            is_dev,
            is_transitive: false,
        }
    }

    #[must_use]
    pub fn transitive(
        name: impl Into<String>,
        version_expr: impl Into<String>,
        is_dev: bool,
    ) -> Self {
        Self {
            name: name.into(),
            version_expr: version_expr.into(),
            is_dev,
            is_transitive: true,
        }
    }

    fn group(&self) -> DepGroup {
        DepGroup::from_dev(self.is_dev)
    }
}

/// Identity of one physical install: a name at a concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstallationKey {
    pub name: String,
    pub version: String,
}

impl InstallationKey {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for InstallationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Where packages go and whether project files are kept in sync.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Directory receiving `<name>/` package trees.
    pub store_root: PathBuf,
    /// Project whose manifest and lockfile are updated; `None` for global installs.
    pub project_root: Option<PathBuf>,
    /// Maximum simultaneous registry/fetch operations.
    pub concurrency: usize,
}

impl InstallOptions {
    /// Install into `<project_root>/node_modules` and update project files.
    #[must_use]
    pub fn project(project_root: &Path) -> Self {
        Self {
            store_root: node_modules_dir(project_root),
            project_root: Some(project_root.to_path_buf()),
            concurrency: crate::config::DEFAULT_CONCURRENCY,
        }
    }

    /// Install into a global directory without touching any project.
    #[must_use]
    pub fn global(store_root: &Path) -> Self {
        Self {
            store_root: store_root.to_path_buf(),
            project_root: None,
            concurrency: crate::config::DEFAULT_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Serializable error code and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: &'static str,
    pub message: String,
}

impl From<&PkgError> for ErrorInfo {
    fn from(e: &PkgError) -> Self {
        Self {
            code: e.code(),
            message: e.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootStatus {
    Installed,
    Conflict,
    Failed,
}

/// What happened to one root request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootOutcome {
    pub name: String,
    pub version_expr: String,
    pub dev: bool,
    pub status: RootStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub digest: String,
    pub files: u64,
    pub dev: bool,
    pub transitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPackage {
    pub name: String,
    pub version_expr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_by: Option<String>,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: InstallationKey,
    pub to: InstallationKey,
}

/// A request for a version other than the one already claimed for its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConflict {
    pub name: String,
    pub kept_version: String,
    pub requested: String,
    pub resolved_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_by: Option<String>,
}

/// Summary of one install run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub roots: Vec<RootOutcome>,
    pub installed: Vec<InstalledPackage>,
    pub skipped: Vec<SkippedPackage>,
    pub edges: Vec<DependencyEdge>,
    pub conflicts: Vec<VersionConflict>,
    pub warnings: Vec<ErrorInfo>,
    /// Branches that reused another branch's fetch.
    pub deduplicated: usize,
}

impl InstallReport {
    /// Roots that did not install.
    pub fn failed_roots(&self) -> impl Iterator<Item = &RootOutcome> {
        self.roots
            .iter()
            .filter(|r| r.status == RootStatus::Failed)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed_roots().next().is_some()
    }

    /// Number of physical fetches performed.
    #[must_use]
    pub fn fetched(&self) -> usize {
        self.installed.len()
    }
}

type FetchOutcome = Result<ExtractSummary, PkgError>;
type FetchCell = Arc<OnceCell<FetchOutcome>>;

struct Claim {
    version: String,
    cell: FetchCell,
}

enum ClaimResult {
    Claimed(FetchCell),
    Conflict { kept: String },
}

/// How far one dependency branch got.
enum Visit {
    Done,
    /// The root was cancelled before this request claimed anything.
    Interrupted,
}

struct ProjectFiles {
    manifest: Mutex<Manifest>,
    lockfile: Mutex<LockfileManager>,
    root: PathBuf,
}

/// A claimed root and the token that cancels its remaining work.
struct RootTask {
    index: usize,
    key: InstallationKey,
    cancel: CancellationToken,
}

/// Installation context for one run, shared by every branch of the graph.
pub struct Installer<'a, M, A> {
    metadata: &'a M,
    artifacts: &'a A,
    store_root: PathBuf,
    concurrency: usize,
    permits: Semaphore,
    claims: Mutex<HashMap<String, Claim>>,
    /// Installed packages whose children were not all visited because the
    /// branch that fetched them was cancelled.
    pending: Mutex<HashMap<InstallationKey, Vec<PackageRequest>>>,
    /// Installed packages whose subtree failed.
    broken: Mutex<HashMap<InstallationKey, PkgError>>,
    project: Option<ProjectFiles>,
    report: Mutex<InstallReport>,
}

impl<'a, M: MetadataSource, A: ArtifactSource> Installer<'a, M, A> {
    /// Prepare a run. In project mode the manifest and lockfile are read
    /// here, before any network activity.
    ///
    /// # Errors
    /// `PKG_MANIFEST_ERROR` if the manifest is missing or invalid,
    /// `PKG_LOCKFILE_INVALID` if an existing lockfile cannot be parsed.
    pub fn new(metadata: &'a M, artifacts: &'a A, options: InstallOptions) -> Result<Self, PkgError> {
        let project = match &options.project_root {
            Some(root) => Some(ProjectFiles {
                manifest: Mutex::new(read_manifest(root)?),
                lockfile: Mutex::new(LockfileManager::open(root)?),
                root: root.clone(),
            }),
            None => None,
        };
        let concurrency = options.concurrency.max(1);

        Ok(Self {
            metadata,
            artifacts,
            store_root: options.store_root,
            concurrency,
            permits: Semaphore::new(concurrency),
            claims: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashMap::new()),
            project,
            report: Mutex::new(InstallReport::default()),
        })
    }

    /// Root requests declared by the project manifest: `dependencies` first,
    /// then `devDependencies`.
    pub async fn declared_roots(&self) -> Vec<PackageRequest> {
        let Some(project) = &self.project else {
            return Vec::new();
        };
        let manifest = project.manifest.lock().await;
        manifest
            .dependencies()
            .into_iter()
            .map(|(name, range)| PackageRequest::root(name, range, false))
            .chain(
                manifest
                    .dev_dependencies()
                    .into_iter()
                    .map(|(name, range)| PackageRequest::root(name, range, true)),
            )
            .collect()
    }

    /// Install every root and its transitive closure.
    ///
    /// Roots are independent: a failing root is reported and the others
    /// carry on. Within one root, a fatal error cancels the work that root
    /// has not started yet. Fetches already under way always complete, and
    /// a shared package left half-visited by a cancelled root is finished
    /// by the next healthy root that depends on it.
    pub async fn install_roots(self, roots: Vec<PackageRequest>) -> InstallReport {
        if roots.is_empty() {
            return self.finish();
        }

        if let Some(project) = &self.project {
            let ensured = project.lockfile.lock().await.ensure_lockfile_exists();
            if let Err(e) = ensured {
                self.warn(&e).await;
            }
        }

        let mut outcomes: Vec<RootOutcome> = roots
            .iter()
            .map(|r| RootOutcome {
                name: r.name.clone(),
                version_expr: r.version_expr.clone(),
                dev: r.is_dev,
                status: RootStatus::Failed,
                resolved: None,
                error: None,
            })
            .collect();

        // Resolve all roots up front so they claim their names before any
        // transitive request can.
        let resolutions = join_all(roots.iter().map(|r| self.resolve(r))).await;

        let mut claimed = Vec::new();
        for (index, (request, resolution)) in roots.iter().zip(resolutions).enumerate() {
            let resolved = match resolution {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(name = %request.name, error = %e, "Failed to resolve root package");
                    outcomes[index].error = Some(ErrorInfo::from(&e));
                    continue;
                }
            };
            let key = InstallationKey::new(&resolved.name, &resolved.version);
            outcomes[index].resolved = Some(resolved.version.clone());

            match self.claim(&key).await {
                ClaimResult::Claimed(cell) => claimed.push((request, resolved, cell, RootTask {
                    index,
                    key,
                    cancel: CancellationToken::new(),
                })),
                ClaimResult::Conflict { kept } => {
                    self.conflict(request, &key, kept, None).await;
                    outcomes[index].status = RootStatus::Conflict;
                }
            }
        }

        let this = &self;
        let results = join_all(claimed.into_iter().map(|(request, resolved, cell, task)| {
            async move {
                let result = this
                    .materialize(request, &resolved, task.key.clone(), cell, &task.cancel)
                    .await;
                (task, result)
            }
        }))
        .await;

        let mut tasks = Vec::with_capacity(results.len());
        for (task, result) in results {
            match result {
                Ok(()) => outcomes[task.index].status = RootStatus::Installed,
                Err(e) => {
                    warn!(name = %outcomes[task.index].name, error = %e, "Root package failed");
                    outcomes[task.index].error = Some(ErrorInfo::from(&e));
                }
            }
            tasks.push(task);
        }

        self.settle(&tasks, &mut outcomes).await;

        let mut report = self.finish();
        report.roots = outcomes;
        report
    }

    /// Finish descents left pending by cancelled roots, then fail every
    /// root whose closure still contains a broken subtree.
    async fn settle(&self, tasks: &[RootTask], outcomes: &mut [RootOutcome]) {
        loop {
            let mut progressed = false;

            for task in tasks {
                if outcomes[task.index].status != RootStatus::Installed {
                    continue;
                }
                let reach = self.reachable(&task.key).await;
                if let Some(e) = self.broken_in(&reach).await {
                    self.fail_root(&mut outcomes[task.index], &e);
                    continue;
                }

                let owned: Vec<(InstallationKey, Vec<PackageRequest>)> = {
                    let mut pending = self.pending.lock().await;
                    reach.iter().filter_map(|k| pending.remove_entry(k)).collect()
                };
                if owned.is_empty() {
                    continue;
                }
                progressed = true;
                debug!(root = %task.key, packages = owned.len(), "Finishing interrupted dependencies");

                let results = join_all(
                    owned
                        .into_iter()
                        .map(|(key, children)| async move { self.descend(&key, children, &task.cancel).await }),
                )
                .await;
                if let Some(e) = results.into_iter().find_map(Result::err) {
                    self.fail_root(&mut outcomes[task.index], &e);
                }
            }

            if !progressed {
                break;
            }
        }

        for task in tasks {
            if outcomes[task.index].status != RootStatus::Installed {
                continue;
            }
            let reach = self.reachable(&task.key).await;
            if let Some(e) = self.broken_in(&reach).await {
                self.fail_root(&mut outcomes[task.index], &e);
            }
        }
    }

    fn fail_root(&self, outcome: &mut RootOutcome, error: &PkgError) {
        warn!(name = %outcome.name, error = %error, "Root package failed");
        outcome.status = RootStatus::Failed;
        outcome.error = Some(ErrorInfo::from(error));
    }

    /// Every key reachable from `from` along recorded dependency edges.
    async fn reachable(&self, from: &InstallationKey) -> HashSet<InstallationKey> {
        let report = self.report.lock().await;
        let mut seen = HashSet::from([from.clone()]);
        let mut queue = vec![from.clone()];
        while let Some(key) = queue.pop() {
            for edge in report.edges.iter().filter(|e| e.from == key) {
                if seen.insert(edge.to.clone()) {
                    queue.push(edge.to.clone());
                }
            }
        }
        seen
    }

    async fn broken_in(&self, keys: &HashSet<InstallationKey>) -> Option<PkgError> {
        let broken = self.broken.lock().await;
        keys.iter().find_map(|k| broken.get(k).cloned())
    }

    fn finish(self) -> InstallReport {
        let mut report = self.report.into_inner();
        report.installed.sort_by(|a, b| a.name.cmp(&b.name));
        report.edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        report.edges.dedup();
        report
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, PkgError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| PkgError::filesystem(format!("Worker pool closed: {e}")))
    }

    async fn resolve(&self, request: &PackageRequest) -> Result<ResolvedPackage, PkgError> {
        validate_package_name(&request.name)?;
        let _permit = self.permit().await?;
        debug!(name = %request.name, expr = %request.version_expr, "Resolving");
        self.metadata
            .resolve(&request.name, &request.version_expr)
            .await
    }

    async fn claim(&self, key: &InstallationKey) -> ClaimResult {
        let mut claims = self.claims.lock().await;
        match claims.get(&key.name) {
            Some(claim) if claim.version == key.version => ClaimResult::Claimed(claim.cell.clone()),
            Some(claim) => ClaimResult::Conflict {
                kept: claim.version.clone(),
            },
            None => {
                let cell = FetchCell::default();
                claims.insert(
                    key.name.clone(),
                    Claim {
                        version: key.version.clone(),
                        cell: cell.clone(),
                    },
                );
                ClaimResult::Claimed(cell)
            }
        }
    }

    /// Drop a failed claim so a later request may try again.
    async fn release(&self, name: &str, cell: &FetchCell) {
        let mut claims = self.claims.lock().await;
        if claims
            .get(name)
            .is_some_and(|claim| Arc::ptr_eq(&claim.cell, cell))
        {
            claims.remove(name);
        }
    }

    fn install_dependency(
        &self,
        request: PackageRequest,
        parent: InstallationKey,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Visit, PkgError>> {
        async move {
            // A dependency name that cannot be a store path is bad metadata
            if let Err(e) = validate_package_name(&request.name) {
                let e = PkgError::malformed(format!("{parent}: {}", e.message()));
                self.skip(&request, &parent, &e).await;
                return Ok(Visit::Done);
            }

            // Nothing is claimed until resolution finishes, so it may be dropped
            let resolution = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(Visit::Interrupted),
                resolution = self.resolve(&request) => resolution,
            };
            let resolved = match resolution {
                Ok(resolved) => resolved,
                Err(e) if e.is_skippable() => {
                    self.skip(&request, &parent, &e).await;
                    return Ok(Visit::Done);
                }
                Err(e) => return Err(e),
            };

            let key = InstallationKey::new(&resolved.name, &resolved.version);
            self.report.lock().await.edges.push(DependencyEdge {
                from: parent.clone(),
                to: key.clone(),
            });

            match self.claim(&key).await {
                ClaimResult::Claimed(cell) => {
                    self.materialize(&request, &resolved, key, cell, &cancel)
                        .await?;
                }
                ClaimResult::Conflict { kept } => {
                    self.conflict(&request, &key, kept, Some(&parent)).await;
                }
            }
            Ok(Visit::Done)
        }
        .boxed()
    }

    /// Fetch once per claim, then (only in the branch that fetched) link,
    /// record and descend.
    async fn materialize(
        &self,
        request: &PackageRequest,
        resolved: &ResolvedPackage,
        key: InstallationKey,
        cell: FetchCell,
        cancel: &CancellationToken,
    ) -> Result<(), PkgError> {
        let mut fetched_here = false;
        let outcome = {
            let fetched = &mut fetched_here;
            let key = &key;
            cell.get_or_init(|| async move {
                *fetched = true;
                info!(package = %key, "Installing");
                let _permit = self.permit().await?;
                self.artifacts
                    .fetch_and_extract(&resolved.tarball_url, &resolved.name, &self.store_root)
                    .await
            })
            .await
            .clone()
        };

        if !fetched_here {
            debug!(package = %key, "Already installed in this run");
            self.report.lock().await.deduplicated += 1;
            return outcome.map(|_| ());
        }

        let summary = match outcome {
            Ok(summary) => summary,
            Err(e) => {
                self.release(&key.name, &cell).await;
                return Err(e);
            }
        };

        self.register(request, resolved, &summary).await;
        info!(package = %key, files = summary.files, "Installed");

        let children: Vec<PackageRequest> = resolved
            .dependencies
            .iter()
            .map(|(name, expr)| PackageRequest::transitive(name, expr, request.is_dev))
            .collect();

        self.descend(&key, children, cancel).await
    }

    /// Visit the children of an installed package.
    ///
    /// The first fatal error cancels the rest of the root's work and marks
    /// `key` broken. Children that never started because of a cancellation
    /// are kept pending under `key`, to be finished by another root.
    async fn descend(
        &self,
        key: &InstallationKey,
        children: Vec<PackageRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), PkgError> {
        let failure: Mutex<Option<PkgError>> = Mutex::new(None);
        let interrupted: Mutex<Vec<PackageRequest>> = Mutex::new(Vec::new());

        stream::iter(children)
            .for_each_concurrent(Some(self.concurrency), |child| {
                let failure = &failure;
                let interrupted = &interrupted;
                async move {
                    let visit = self
                        .install_dependency(child.clone(), key.clone(), cancel.clone())
                        .await;
                    match visit {
                        Ok(Visit::Done) => {}
                        Ok(Visit::Interrupted) => interrupted.lock().await.push(child),
                        Err(e) => {
                            cancel.cancel();
                            failure.lock().await.get_or_insert(e);
                        }
                    }
                }
            })
            .await;

        if let Some(e) = failure.into_inner() {
            self.broken.lock().await.insert(key.clone(), e.clone());
            return Err(e);
        }
        let interrupted = interrupted.into_inner();
        if !interrupted.is_empty() {
            debug!(package = %key, left = interrupted.len(), "Dependencies left for another root");
            self.pending.lock().await.insert(key.clone(), interrupted);
        }
        Ok(())
    }

    /// Bin links, manifest and lockfile for a freshly extracted package.
    async fn register(
        &self,
        request: &PackageRequest,
        resolved: &ResolvedPackage,
        summary: &ExtractSummary,
    ) {
        let install_path = self.store_root.join(&resolved.name);

        let link_warnings = publish_executables(
            &install_path,
            &resolved.executables,
            &bin_dir(&self.store_root),
        );

        {
            let mut report = self.report.lock().await;
            report.installed.push(InstalledPackage {
                name: resolved.name.clone(),
                version: resolved.version.clone(),
                path: install_path,
                digest: summary.digest.clone(),
                files: summary.files,
                dev: request.is_dev,
                transitive: request.is_transitive,
            });
            report
                .warnings
                .extend(link_warnings.iter().map(ErrorInfo::from));
        }

        let Some(project) = &self.project else {
            return;
        };

        if !request.is_transitive {
            let mut manifest = project.manifest.lock().await;
            if manifest.set_dependency(&resolved.name, &resolved.version, request.group()) {
                if let Err(e) = write_manifest(&project.root, &manifest) {
                    drop(manifest);
                    self.warn(&e).await;
                }
            }
        }

        let recorded = {
            let mut lockfile = project.lockfile.lock().await;
            let entry = lock_entry(
                lockfile.get(&resolved.name),
                &request.version_expr,
                &resolved.version,
            );
            lockfile.record(&resolved.name, entry)
        };
        if let Err(e) = recorded {
            self.warn(&e).await;
        }
    }

    async fn skip(&self, request: &PackageRequest, parent: &InstallationKey, error: &PkgError) {
        warn!(name = %request.name, required_by = %parent, error = %error, "Skipping package");
        self.report.lock().await.skipped.push(SkippedPackage {
            name: request.name.clone(),
            version_expr: request.version_expr.clone(),
            required_by: Some(parent.to_string()),
            error: ErrorInfo::from(error),
        });
    }

    async fn conflict(
        &self,
        request: &PackageRequest,
        key: &InstallationKey,
        kept: String,
        parent: Option<&InstallationKey>,
    ) {
        warn!(
            name = %key.name,
            kept = %kept,
            requested = %request.version_expr,
            resolved = %key.version,
            "Version conflict, keeping the first claimed version"
        );
        self.report.lock().await.conflicts.push(VersionConflict {
            name: key.name.clone(),
            kept_version: kept,
            requested: request.version_expr.clone(),
            resolved_version: key.version.clone(),
            required_by: parent.map(ToString::to_string),
        });
    }

    async fn warn(&self, error: &PkgError) {
        warn!(error = %error, "Warning");
        self.report.lock().await.warnings.push(ErrorInfo::from(error));
    }
}

/// Lockfile entry for a fresh install.
///
/// A root whose manifest range was rewritten to the exact version it
/// resolved to keeps the range it was originally requested with.
fn lock_entry(existing: Option<&LockEntry>, requested: &str, resolved: &str) -> LockEntry {
    match existing {
        Some(entry) if entry.resolved == resolved && requested == resolved => entry.clone(),
        _ => LockEntry::new(requested, resolved),
    }
}

/// Install everything the project manifest declares.
///
/// # Errors
/// `PKG_MANIFEST_ERROR` / `PKG_LOCKFILE_INVALID` before any network
/// activity; per-package failures are reported in the returned report.
pub async fn install_project<M: MetadataSource, A: ArtifactSource>(
    metadata: &M,
    artifacts: &A,
    options: InstallOptions,
) -> Result<InstallReport, PkgError> {
    let installer = Installer::new(metadata, artifacts, options)?;
    let roots = installer.declared_roots().await;
    Ok(installer.install_roots(roots).await)
}

/// Install one package as a root request.
///
/// # Errors
/// See [`install_project`].
pub async fn add_package<M: MetadataSource, A: ArtifactSource>(
    metadata: &M,
    artifacts: &A,
    spec: &PackageSpec,
    is_dev: bool,
    options: InstallOptions,
) -> Result<InstallReport, PkgError> {
    let installer = Installer::new(metadata, artifacts, options)?;
    let root = PackageRequest::root(&spec.name, spec.version_expr(), is_dev);
    Ok(installer.install_roots(vec![root]).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use crate::pkg::lockfile::Lockfile;
    use crate::pkg::version::{normalize_version_expr, LATEST};
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeRegistry {
        packages: HashMap<String, Vec<ResolvedPackage>>,
        malformed: HashSet<String>,
    }

    impl FakeRegistry {
        fn publish(&mut self, name: &str, version: &str, deps: &[(&str, &str)]) {
            self.publish_with_bin(name, version, deps, &[]);
        }

        fn publish_with_bin(
            &mut self,
            name: &str,
            version: &str,
            deps: &[(&str, &str)],
            bins: &[(&str, &str)],
        ) {
            let pairs = |items: &[(&str, &str)]| {
                items
                    .iter()
                    .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
                    .collect()
            };
            self.packages
                .entry(name.to_string())
                .or_default()
                .push(ResolvedPackage {
                    name: name.to_string(),
                    version: version.to_string(),
                    tarball_url: format!("mock://{name}/{version}"),
                    dependencies: pairs(deps),
                    executables: pairs(bins),
                });
        }
    }

    impl MetadataSource for FakeRegistry {
        async fn resolve(
            &self,
            name: &str,
            version_expr: &str,
        ) -> Result<ResolvedPackage, PkgError> {
            tokio::task::yield_now().await;
            if self.malformed.contains(name) {
                return Err(PkgError::malformed(format!("garbage for {name}")));
            }
            let query = normalize_version_expr(version_expr);
            let versions = self
                .packages
                .get(name)
                .ok_or_else(|| PkgError::not_found(name, &query))?;
            let found = if query == LATEST {
                versions.last()
            } else {
                versions.iter().find(|p| p.version == query)
            };
            found.cloned().ok_or_else(|| PkgError::not_found(name, &query))
        }
    }

    /// Writes a one-file package per fetch and counts fetches per key.
    #[derive(Default)]
    struct FakeFetcher {
        fetches: StdMutex<HashMap<String, usize>>,
        failing: HashSet<String>,
        delay: Option<Duration>,
        slow: HashMap<String, Duration>,
    }

    impl FakeFetcher {
        fn count(&self, url_key: &str) -> usize {
            self.fetches
                .lock()
                .unwrap()
                .get(url_key)
                .copied()
                .unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.fetches.lock().unwrap().values().sum()
        }
    }

    impl ArtifactSource for FakeFetcher {
        async fn fetch_and_extract(
            &self,
            tarball_url: &str,
            name: &str,
            destination_root: &Path,
        ) -> Result<ExtractSummary, PkgError> {
            let key = tarball_url.trim_start_matches("mock://").to_string();
            *self.fetches.lock().unwrap().entry(key).or_default() += 1;

            if let Some(delay) = self.delay.or_else(|| self.slow.get(name).copied()) {
                tokio::time::sleep(delay).await;
            }
            if self.failing.contains(name) {
                return Err(PkgError::decompression(format!("corrupt tarball for {name}")));
            }

            let dir = destination_root.join(name);
            fs::create_dir_all(dir.join("bin"))?;
            fs::write(dir.join("index.js"), tarball_url)?;
            fs::write(dir.join("bin/cli.js"), "#!/usr/bin/env node\n")?;
            Ok(ExtractSummary {
                files: 2,
                bytes: tarball_url.len() as u64,
                digest: tarball_url.to_string(),
            })
        }
    }

    fn project(deps: &str) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            format!(r#"{{"name":"app","version":"1.0.0","dependencies":{deps}}}"#),
        )
        .unwrap();
        dir
    }

    async fn run(
        registry: &FakeRegistry,
        fetcher: &FakeFetcher,
        root: &Path,
    ) -> InstallReport {
        install_project(registry, fetcher, InstallOptions::project(root))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_diamond_fetches_shared_package_once() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("b", "1.0.0"), ("c", "1.0.0")]);
        registry.publish("b", "1.0.0", &[("d", "^1.0.0")]);
        registry.publish("c", "1.0.0", &[("d", "~1.0.0")]);
        registry.publish("d", "1.0.0", &[]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"a":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(!report.has_failures());
        assert_eq!(fetcher.count("d/1.0.0"), 1);
        assert_eq!(fetcher.total(), 4);
        assert_eq!(report.fetched(), 4);
        assert_eq!(report.deduplicated, 1);

        let d = InstallationKey::new("d", "1.0.0");
        let parents: Vec<_> = report
            .edges
            .iter()
            .filter(|e| e.to == d)
            .map(|e| e.from.name.as_str())
            .collect();
        assert_eq!(parents, vec!["b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_branches_share_one_fetch() {
        let mut registry = FakeRegistry::default();
        let parents: Vec<String> = (0..12).map(|i| format!("p{i}")).collect();
        let root_deps: Vec<(&str, &str)> = parents.iter().map(|p| (p.as_str(), "1.0.0")).collect();
        registry.publish("root", "1.0.0", &root_deps);
        for p in &parents {
            registry.publish(p, "1.0.0", &[("shared", "2.0.0")]);
        }
        registry.publish("shared", "2.0.0", &[]);
        let fetcher = FakeFetcher {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let dir = project(r#"{"root":"1.0.0"}"#);

        let report = install_project(
            &registry,
            &fetcher,
            InstallOptions::project(dir.path()).with_concurrency(8),
        )
        .await
        .unwrap();

        assert!(!report.has_failures());
        assert_eq!(fetcher.count("shared/2.0.0"), 1);
        assert_eq!(report.deduplicated, 11);
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("b", "1.0.0")]);
        registry.publish("b", "1.0.0", &[("a", "1.0.0")]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"a":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(!report.has_failures());
        assert_eq!(fetcher.count("a/1.0.0"), 1);
        assert_eq!(fetcher.count("b/1.0.0"), 1);
        assert!(dir.path().join("node_modules/a/index.js").exists());
        assert!(dir.path().join("node_modules/b/index.js").exists());
    }

    #[tokio::test]
    async fn test_first_claim_wins_on_conflict() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[]);
        registry.publish("a", "2.0.0", &[]);
        registry.publish("b", "1.0.0", &[("a", "2.0.0")]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"a":"1.0.0","b":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(!report.has_failures());
        assert_eq!(fetcher.count("a/1.0.0"), 1);
        assert_eq!(fetcher.count("a/2.0.0"), 0);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].kept_version, "1.0.0");
        assert_eq!(report.conflicts[0].resolved_version, "2.0.0");
        assert_eq!(report.conflicts[0].required_by.as_deref(), Some("b@1.0.0"));
    }

    #[tokio::test]
    async fn test_malformed_transitive_is_skipped() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("broken", "1.0.0"), ("ok", "1.0.0")]);
        registry.publish("ok", "1.0.0", &[]);
        registry.malformed.insert("broken".to_string());
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"a":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(!report.has_failures());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].name, "broken");
        assert_eq!(report.skipped[0].error.code, codes::PKG_MALFORMED_RESPONSE);
        assert!(dir.path().join("node_modules/ok").exists());
    }

    #[tokio::test]
    async fn test_unsafe_dependency_name_is_skipped() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("../escape", "1.0.0")]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"a":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(!report.has_failures());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].error.code, codes::PKG_MALFORMED_RESPONSE);
        assert_eq!(report.skipped[0].required_by.as_deref(), Some("a@1.0.0"));
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_failed_root_does_not_stop_others() {
        let mut registry = FakeRegistry::default();
        registry.publish("good", "1.0.0", &[]);
        registry.publish("corrupt", "1.0.0", &[]);
        let fetcher = FakeFetcher {
            failing: ["corrupt".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let dir = project(r#"{"missing":"1.0.0","corrupt":"1.0.0","good":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        let statuses: Vec<_> = report.roots.iter().map(|r| (r.name.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("missing", RootStatus::Failed),
                ("corrupt", RootStatus::Failed),
                ("good", RootStatus::Installed),
            ]
        );
        assert_eq!(report.failed_roots().count(), 2);
        assert_eq!(
            report.roots[1].error.as_ref().map(|e| e.code),
            Some(codes::PKG_DECOMPRESSION_FAILED)
        );

        let lockfile = Lockfile::read_from(&dir.path().join("tarn-lock.yaml"))
            .unwrap()
            .unwrap();
        assert!(lockfile.packages.contains_key("good"));
        assert!(!lockfile.packages.contains_key("corrupt"));
    }

    #[tokio::test]
    async fn test_cancelled_root_does_not_orphan_shared_subtree() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("shared", "1.0.0"), ("bad", "1.0.0")]);
        registry.publish("b", "1.0.0", &[("shared", "1.0.0")]);
        registry.publish("shared", "1.0.0", &[("leaf", "1.0.0")]);
        registry.publish("leaf", "1.0.0", &[]);
        registry.publish("bad", "1.0.0", &[]);
        // `bad` fails while `shared` is still downloading under root `a`
        let fetcher = FakeFetcher {
            failing: ["bad".to_string()].into_iter().collect(),
            slow: [("shared".to_string(), Duration::from_millis(150))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let dir = project(r#"{"a":"1.0.0","b":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        let statuses: Vec<_> = report.roots.iter().map(|r| (r.name.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![("a", RootStatus::Failed), ("b", RootStatus::Installed)]
        );
        assert_eq!(fetcher.count("shared/1.0.0"), 1);
        assert_eq!(fetcher.count("leaf/1.0.0"), 1);
        assert!(dir.path().join("node_modules/leaf/index.js").exists());

        let lockfile = Lockfile::read_from(&dir.path().join("tarn-lock.yaml"))
            .unwrap()
            .unwrap();
        assert!(lockfile.packages.contains_key("leaf"));
        assert!(report.installed.iter().any(|p| p.name == "leaf"));
    }

    #[tokio::test]
    async fn test_root_sharing_a_failed_subtree_fails() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("shared", "1.0.0")]);
        registry.publish("b", "1.0.0", &[("shared", "1.0.0")]);
        registry.publish("shared", "1.0.0", &[("bad", "1.0.0")]);
        registry.publish("bad", "1.0.0", &[]);
        let fetcher = FakeFetcher {
            failing: ["bad".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let dir = project(r#"{"a":"1.0.0","b":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert_eq!(report.failed_roots().count(), 2);
        for root in &report.roots {
            assert_eq!(
                root.error.as_ref().map(|e| e.code),
                Some(codes::PKG_DECOMPRESSION_FAILED),
                "{}",
                root.name
            );
        }
        assert_eq!(fetcher.count("shared/1.0.0"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_root_leaves_unrelated_roots_installed() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("bad", "1.0.0"), ("mine", "1.0.0")]);
        registry.publish("b", "1.0.0", &[("theirs", "1.0.0")]);
        registry.publish("bad", "1.0.0", &[]);
        registry.publish("mine", "1.0.0", &[]);
        registry.publish("theirs", "1.0.0", &[("deep", "1.0.0")]);
        registry.publish("deep", "1.0.0", &[]);
        let fetcher = FakeFetcher {
            failing: ["bad".to_string()].into_iter().collect(),
            slow: [("theirs".to_string(), Duration::from_millis(50))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let dir = project(r#"{"a":"1.0.0","b":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert_eq!(report.roots[0].status, RootStatus::Failed);
        assert_eq!(report.roots[1].status, RootStatus::Installed);
        assert!(dir.path().join("node_modules/deep/index.js").exists());
        // Every fetch ran at most once, cancelled or not
        assert!(fetcher.fetches.lock().unwrap().values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_fatal_transitive_error_fails_root() {
        let mut registry = FakeRegistry::default();
        registry.publish("a", "1.0.0", &[("bad", "1.0.0")]);
        registry.publish("bad", "1.0.0", &[]);
        let fetcher = FakeFetcher {
            failing: ["bad".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let dir = project(r#"{"a":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(report.has_failures());
        assert!(!dir.path().join("node_modules/bad").exists());
    }

    #[tokio::test]
    async fn test_updates_manifest_and_lockfile() {
        let mut registry = FakeRegistry::default();
        registry.publish("leftpad", "1.2.0", &[]);
        registry.publish("leftpad", "1.3.0", &[("util", "~0.1.0")]);
        registry.publish("util", "0.1.0", &[]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"leftpad":"^1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;
        assert_eq!(report.roots[0].resolved.as_deref(), Some("1.3.0"));

        let manifest = read_manifest(dir.path()).unwrap();
        assert_eq!(
            manifest.dependencies(),
            vec![("leftpad".to_string(), "1.3.0".to_string())]
        );

        let lock_path = dir.path().join("tarn-lock.yaml");
        let lockfile = Lockfile::read_from(&lock_path).unwrap().unwrap();
        assert_eq!(lockfile.packages["leftpad"], LockEntry::new("^1.0.0", "1.3.0"));
        assert_eq!(lockfile.packages["util"], LockEntry::new("~0.1.0", "0.1.0"));

        // Second run sees the pinned manifest and keeps the lockfile as is
        let before = fs::read(&lock_path).unwrap();
        let rerun = run(&registry, &fetcher, dir.path()).await;
        assert!(!rerun.has_failures());
        assert_eq!(fs::read(&lock_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_add_dev_dependency() {
        let mut registry = FakeRegistry::default();
        registry.publish("jest", "29.0.0", &[]);
        let fetcher = FakeFetcher::default();
        let dir = project("{}");

        let spec = PackageSpec::parse("jest").unwrap();
        let report = add_package(
            &registry,
            &fetcher,
            &spec,
            true,
            InstallOptions::project(dir.path()),
        )
        .await
        .unwrap();

        assert!(!report.has_failures());
        let manifest = read_manifest(dir.path()).unwrap();
        assert!(manifest.dependencies().is_empty());
        assert_eq!(
            manifest.dev_dependencies(),
            vec![("jest".to_string(), "29.0.0".to_string())]
        );
    }

    #[tokio::test]
    async fn test_global_install_skips_project_files() {
        let mut registry = FakeRegistry::default();
        registry.publish("tool", "1.0.0", &[]);
        let fetcher = FakeFetcher::default();
        let global = tempdir().unwrap();

        let spec = PackageSpec::parse("tool@1.0.0").unwrap();
        let report = add_package(
            &registry,
            &fetcher,
            &spec,
            false,
            InstallOptions::global(global.path()),
        )
        .await
        .unwrap();

        assert!(!report.has_failures());
        assert!(global.path().join("tool/index.js").exists());
        assert!(!global.path().join("tarn-lock.yaml").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_links_executables() {
        let mut registry = FakeRegistry::default();
        registry.publish_with_bin("tool", "1.0.0", &[], &[("tool", "bin/cli.js")]);
        let fetcher = FakeFetcher::default();
        let dir = project(r#"{"tool":"1.0.0"}"#);

        let report = run(&registry, &fetcher, dir.path()).await;

        assert!(report.warnings.is_empty());
        let link = dir.path().join("node_modules/.bin/tool");
        assert_eq!(
            fs::read_link(link).unwrap(),
            dir.path().join("node_modules/tool/bin/cli.js")
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_is_fatal_before_network() {
        let registry = FakeRegistry::default();
        let fetcher = FakeFetcher::default();
        let dir = tempdir().unwrap();

        let err = install_project(&registry, &fetcher, InstallOptions::project(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PKG_MANIFEST_ERROR);
        assert_eq!(fetcher.total(), 0);
    }

    #[test]
    fn test_lock_entry_keeps_original_range() {
        let existing = LockEntry::new("^1.0.0", "1.3.0");
        assert_eq!(lock_entry(Some(&existing), "1.3.0", "1.3.0"), existing);
        assert_eq!(
            lock_entry(Some(&existing), "^1.0.0", "1.4.0"),
            LockEntry::new("^1.0.0", "1.4.0")
        );
        assert_eq!(lock_entry(None, "1.3.0", "1.3.0"), LockEntry::new("1.3.0", "1.3.0"));
    }
}
