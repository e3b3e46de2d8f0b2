//! Version-expression normalization and registry-backed resolution.
//!
//! This is deliberately not a range solver: an expression is reduced to a
//! single query token the registry can answer directly.

use super::error::PkgError;
use super::registry::{parse_metadata, RegistryClient, ResolvedPackage};
use regex_lite::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Query token asking the registry for its `latest` dist-tag.
pub const LATEST: &str = "latest";

fn comparator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[<>]=?\s*v?(\d+\.\d+\.\d+)").expect("comparator regex is valid")
    })
}

/// Reduce a version expression to the token sent to the registry.
///
/// Rules, first match wins:
/// 1. `^…` means "any version" and becomes `latest`
/// 2. `~X.Y.Z` drops the tilde and queries `X.Y.Z`
/// 3. `>=X.Y.Z`, `<=X.Y.Z`, `>X.Y.Z`, `<X.Y.Z` query `X.Y.Z`
/// 4. anything else is passed through (an empty expression means `latest`)
#[must_use]
pub fn normalize_version_expr(expr: &str) -> String {
    let expr = expr.trim();

    if expr.is_empty() || expr.starts_with('^') {
        return LATEST.to_string();
    }

    if let Some(rest) = expr.strip_prefix('~') {
        return rest.trim().to_string();
    }

    if let Some(caps) = comparator_re().captures(expr) {
        return caps[1].to_string();
    }

    expr.to_string()
}

/// Resolve `name` + `expr` to one concrete published version.
///
/// # Errors
/// Propagates registry errors; see [`RegistryClient::fetch_metadata`] and
/// [`parse_metadata`].
pub async fn resolve_package(
    registry: &RegistryClient,
    name: &str,
    expr: &str,
) -> Result<ResolvedPackage, PkgError> {
    let query = normalize_version_expr(expr);
    debug!(name, expr, query = %query, "Resolving version");

    let doc = registry.fetch_metadata(name, Some(&query)).await?;
    let resolved = parse_metadata(name, &doc)?;

    debug!(name, version = %resolved.version, "Resolved version");
    Ok(resolved)
}
