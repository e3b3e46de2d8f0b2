//! npm registry client.

use super::error::PkgError;
use crate::config::Config;
use crate::version::USER_AGENT;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override registry URL.
pub const REGISTRY_ENV: &str = "TARN_REGISTRY";

/// One concrete published version of a package, as described by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPackage {
    pub name: String,
    /// Always a concrete version, never a range.
    pub version: String,
    pub tarball_url: String,
    /// Declared dependencies in registry document order.
    pub dependencies: Vec<(String, String)>,
    /// Command name → entry point path relative to the package root.
    pub executables: Vec<(String, String)>,
}

/// Registry client for fetching package metadata.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: Url,
    http: Client,
    auth_token: Option<String>,
    download_timeout: Duration,
}

impl RegistryClient {
    /// Create a new registry client with the given base URL and default timeouts.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, PkgError> {
        let defaults = Config::default();
        Self::build(
            base_url,
            defaults.connect_timeout(),
            defaults.request_timeout(),
            defaults.download_timeout(),
        )
    }

    /// Create a client from the run configuration (registry, timeouts, token).
    ///
    /// # Errors
    /// Returns an error if the client cannot be created.
    pub fn from_config(config: &Config) -> Result<Self, PkgError> {
        let mut client = Self::build(
            &config.registry,
            config.connect_timeout(),
            config.request_timeout(),
            config.download_timeout(),
        )?;
        client.auth_token.clone_from(&config.auth_token);
        Ok(client)
    }

    fn build(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self, PkgError> {
        // A base without a trailing slash would lose its last path segment on join
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| PkgError::network(format!("Invalid registry URL '{base_url}': {e}")))?;

        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PkgError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http,
            auth_token: None,
            download_timeout,
        })
    }

    /// Get the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Timeout applied to a whole tarball download.
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        self.download_timeout
    }

    /// Start a GET request, attaching the bearer token when `url` is served by
    /// the registry host.
    pub(crate) fn get(&self, url: &str) -> RequestBuilder {
        let request = self.http.get(url);
        match &self.auth_token {
            Some(token) if self.same_host(url) => {
                request.header("Authorization", format!("Bearer {token}"))
            }
            _ => request,
        }
    }

    fn same_host(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .is_some_and(|u| u.host_str() == self.base_url.host_str())
    }

    /// Build `{base}/{name}[/{version}]`.
    ///
    /// # Errors
    /// Returns an error if the joined URL is invalid.
    pub fn metadata_url(&self, name: &str, version: Option<&str>) -> Result<Url, PkgError> {
        // Scoped names travel as a single path segment
        let encoded_name = if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        };
        let path = match version {
            Some(v) => format!("{encoded_name}/{v}"),
            None => encoded_name,
        };

        self.base_url
            .join(&path)
            .map_err(|e| PkgError::network(format!("Failed to build URL for '{name}': {e}")))
    }

    /// Fetch the metadata document for `name` at `version` (or the full
    /// packument when `version` is `None`).
    ///
    /// Performs exactly one GET; retries are the caller's business.
    ///
    /// # Errors
    /// `PKG_NETWORK_ERROR` on transport failure or non-success status,
    /// `PKG_NOT_FOUND` on 404, `PKG_MALFORMED_RESPONSE` if the body is not JSON.
    pub async fn fetch_metadata(&self, name: &str, version: Option<&str>) -> Result<Value, PkgError> {
        let url = self.metadata_url(name, version)?;

        let response = self.get(url.as_str()).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PkgError::not_found(name, version.unwrap_or("*")));
        }

        if !response.status().is_success() {
            return Err(PkgError::network(format!(
                "Registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            PkgError::malformed(format!("Registry response for '{name}' is not valid JSON: {e}"))
        })
    }
}

/// Turn a single-version metadata document into a [`ResolvedPackage`].
///
/// # Errors
/// `PKG_MISSING_FIELD` if `version` or `dist.tarball` is absent,
/// `PKG_MALFORMED_RESPONSE` if `version` is not a concrete semver version.
pub fn parse_metadata(name: &str, doc: &Value) -> Result<ResolvedPackage, PkgError> {
    if !doc.is_object() {
        return Err(PkgError::malformed(format!(
            "Registry response for '{name}' is not a JSON object"
        )));
    }

    let version = doc
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| PkgError::missing_field(name, "version"))?;

    if semver::Version::parse(version).is_err() {
        return Err(PkgError::malformed(format!(
            "Registry returned non-concrete version '{version}' for '{name}'"
        )));
    }

    let tarball_url = doc
        .get("dist")
        .and_then(|d| d.get("tarball"))
        .and_then(Value::as_str)
        .ok_or_else(|| PkgError::missing_field(name, "dist.tarball"))?;

    Ok(ResolvedPackage {
        name: name.to_string(),
        version: version.to_string(),
        tarball_url: tarball_url.to_string(),
        dependencies: string_pairs(doc.get("dependencies")),
        executables: parse_bin(name, doc.get("bin")),
    })
}

/// Collect `{key: "string"}` pairs, dropping non-string values.
fn string_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `bin` is either a command map or a single path named after the package.
fn parse_bin(name: &str, value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::String(path)) => {
            let command = name.rsplit('/').next().unwrap_or(name);
            vec![(command.to_string(), path.clone())]
        }
        other => string_pairs(other),
    }
}
