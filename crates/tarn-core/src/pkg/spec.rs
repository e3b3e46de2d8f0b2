//! Package spec parsing.
//!
//! Parses package specifications like:
//! - `leftpad`
//! - `leftpad@1.3.0`
//! - `leftpad@^1.0.0`
//! - `@types/node`
//! - `@types/node@~20.1.0`

use super::error::PkgError;
use super::version::LATEST;

/// A parsed package specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Version expression as typed; `None` means latest.
    pub range: Option<String>,
}

impl PackageSpec {
    /// Parse a package specification string.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // For scoped names the version delimiter is the second '@'
        let search_from = usize::from(input.starts_with('@'));
        let (name, range) = match input[search_from..].find('@') {
            Some(pos) => {
                let at = pos + search_from;
                let range = &input[at + 1..];
                if range.is_empty() {
                    return Err(PkgError::spec_invalid(format!(
                        "Invalid package spec: empty version range in '{input}'"
                    )));
                }
                (&input[..at], Some(range.to_string()))
            }
            None => (input, None),
        };

        validate_package_name(name)?;

        Ok(Self {
            name: name.to_string(),
            range,
        })
    }

    /// Parse `input`, letting a separately supplied version override any
    /// version embedded in the spec.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse_with_version(input: &str, version: Option<&str>) -> Result<Self, PkgError> {
        let mut spec = Self::parse(input)?;
        if let Some(version) = version.map(str::trim).filter(|v| !v.is_empty()) {
            spec.range = Some(version.to_string());
        }
        Ok(spec)
    }

    /// The version expression to request, defaulting to `latest`.
    #[must_use]
    pub fn version_expr(&self) -> &str {
        self.range.as_deref().unwrap_or(LATEST)
    }
}

/// Check that a package name is safe to use as a path under the store.
///
/// Accepts `name` or `@scope/name`; rejects empty segments, `.`/`..`,
/// leading dots, backslashes, whitespace and extra `/` separators.
///
/// # Errors
/// Returns `PKG_SPEC_INVALID` describing the problem.
pub fn validate_package_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }

    let segments: Vec<&str> = name.split('/').collect();
    let expected = if name.starts_with('@') { 2 } else { 1 };
    if segments.len() != expected {
        return Err(PkgError::spec_invalid(format!(
            "Invalid package name '{name}'"
        )));
    }

    for (i, segment) in segments.iter().enumerate() {
        let body = if i == 0 && expected == 2 {
            &segment[1..]
        } else {
            segment
        };
        if body.is_empty()
            || body.starts_with('.')
            || body
                .chars()
                .any(|c| c.is_whitespace() || c == '\\' || c == '@' || c == ':')
        {
            return Err(PkgError::spec_invalid(format!(
                "Invalid package name '{name}'"
            )));
        }
    }

    Ok(())
}
