//! `.npmrc` reader for registry selection and authentication.
//!
//! Understands two directives:
//! - `registry=URL` picks the default registry
//! - `//host/:_authToken=TOKEN` attaches a bearer token to requests for `host`
//!
//! `${ENV_VAR}` references in token values are expanded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Parsed `.npmrc` configuration.
#[derive(Debug, Clone, Default)]
pub struct NpmrcConfig {
    /// Default registry, if one is configured.
    pub registry: Option<Url>,
    /// Host (optionally with path) → auth token.
    pub auth_tokens: HashMap<String, String>,
}

impl NpmrcConfig {
    /// Find the token for a registry or tarball URL.
    ///
    /// Tries `host/path` first, then the bare host.
    #[must_use]
    pub fn token_for(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let host = url.host_str()?;
        let path = url.path().trim_end_matches('/');
        let host_with_path = if path.is_empty() {
            host.to_string()
        } else {
            format!("{host}{path}")
        };

        self.auth_tokens
            .get(&host_with_path)
            .or_else(|| self.auth_tokens.get(host))
            .cloned()
    }
}

/// Parse a single `.npmrc` file's content.
///
/// Ignores comments (`#`, `;`), blank lines and directives it does not know.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "registry" {
            let url_str = if value.ends_with('/') {
                value.to_string()
            } else {
                format!("{value}/")
            };
            if let Ok(url) = Url::parse(&url_str) {
                config.registry = Some(url);
            }
            continue;
        }

        if let Some(rest) = key.strip_prefix("//") {
            if let Some(host_part) = rest.strip_suffix(":_authToken") {
                let token = expand_env_vars(value);
                if !token.is_empty() {
                    config
                        .auth_tokens
                        .insert(host_part.trim_end_matches('/').to_string(), token);
                }
            }
        }
    }

    config
}

/// Load and merge `.npmrc` files from the project directory up to `$HOME`.
///
/// The file closest to the project wins for every key.
#[must_use]
pub fn load_npmrc_files(project_dir: &Path) -> NpmrcConfig {
    let mut merged = NpmrcConfig::default();

    let mut dir = Some(project_dir.to_path_buf());
    while let Some(d) = dir {
        merge_file(&mut merged, &d.join(".npmrc"));
        dir = d.parent().map(Path::to_path_buf);
    }

    if let Some(home) = home_dir() {
        merge_file(&mut merged, &home.join(".npmrc"));
    }

    merged
}

fn merge_file(target: &mut NpmrcConfig, path: &Path) {
    if !path.is_file() {
        return;
    }
    match std::fs::read_to_string(path) {
        Ok(content) => merge_config(target, &parse_npmrc(&content)),
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable .npmrc"),
    }
}

/// Merge `source` into `target`, keeping existing entries (first wins).
fn merge_config(target: &mut NpmrcConfig, source: &NpmrcConfig) {
    if target.registry.is_none() {
        target.registry.clone_from(&source.registry);
    }
    for (host, token) in &source.auth_tokens {
        target
            .auth_tokens
            .entry(host.clone())
            .or_insert_with(|| token.clone());
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
            // Unset variables expand to nothing, as npm does
            if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .map(PathBuf::from)
}
