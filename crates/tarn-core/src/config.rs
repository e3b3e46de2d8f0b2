use crate::error::Error;
use crate::pkg::npmrc::{load_npmrc_files, NpmrcConfig};
use crate::pkg::registry::{DEFAULT_REGISTRY, REGISTRY_ENV};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on simultaneous registry/tarball operations.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Runtime configuration for tarn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,

    /// Registry base URL every metadata and tarball request is built from.
    pub registry: String,

    /// Bearer token for the registry host, if `.npmrc` provides one.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,

    /// Maximum simultaneous network/extraction operations.
    pub concurrency: usize,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Metadata request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Tarball download timeout in seconds.
    pub download_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
            registry: DEFAULT_REGISTRY.to_string(),
            auth_token: None,
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout_secs: 5,
            request_timeout_secs: 15,
            download_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Build a config for `cwd`, picking the registry from an explicit
    /// override, the environment or the nearest `.npmrc`.
    ///
    /// Precedence: `registry_override` > `TARN_REGISTRY` > `.npmrc`
    /// `registry=` > default registry. The auth token is looked up for
    /// whichever registry wins.
    #[must_use]
    pub fn load(cwd: PathBuf, registry_override: Option<String>) -> Self {
        let npmrc = load_npmrc_files(&cwd);
        Self::from_sources(
            cwd,
            registry_override,
            std::env::var(REGISTRY_ENV).ok(),
            &npmrc,
        )
    }

    fn from_sources(
        cwd: PathBuf,
        registry_override: Option<String>,
        env_registry: Option<String>,
        npmrc: &NpmrcConfig,
    ) -> Self {
        let registry = registry_override
            .filter(|r| !r.trim().is_empty())
            .or_else(|| env_registry.filter(|r| !r.trim().is_empty()))
            .or_else(|| npmrc.registry.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        let auth_token = npmrc.token_for(&registry);

        Self {
            cwd,
            registry,
            auth_token,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Override the registry base URL.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Set the concurrency cap.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Project directory the config applies to.
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.cwd
    }

    /// Check values that would otherwise fail deep inside an install.
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "timeouts must be at least one second".to_string(),
            ));
        }
        url::Url::parse(&self.registry).map_err(|e| {
            Error::InvalidConfig(format!("invalid registry URL '{}': {e}", self.registry))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::npmrc::parse_npmrc;

    #[test]
    fn test_default_registry_and_concurrency() {
        let config = Config::new(PathBuf::from("/tmp/project"));
        assert_eq!(config.registry, DEFAULT_REGISTRY);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_registry_beats_npmrc() {
        let npmrc = parse_npmrc("registry=https://npm.example.com/\n");
        let config = Config::from_sources(
            PathBuf::from("."),
            None,
            Some("http://127.0.0.1:4873".to_string()),
            &npmrc,
        );
        assert_eq!(config.registry, "http://127.0.0.1:4873");
    }

    #[test]
    fn test_override_beats_env_and_picks_its_token() {
        let npmrc = parse_npmrc(
            "registry=https://npm.example.com/\n//private.example.com/:_authToken=tok\n",
        );
        let config = Config::from_sources(
            PathBuf::from("."),
            Some("https://private.example.com/".to_string()),
            Some("http://127.0.0.1:4873".to_string()),
            &npmrc,
        );
        assert_eq!(config.registry, "https://private.example.com/");
        assert_eq!(config.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_npmrc_registry_and_token() {
        let npmrc = parse_npmrc(
            "registry=https://npm.example.com/\n//npm.example.com/:_authToken=secret\n",
        );
        let config = Config::from_sources(PathBuf::from("."), None, None, &npmrc);
        assert_eq!(config.registry, "https://npm.example.com/");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_blank_env_registry_is_ignored() {
        let config = Config::from_sources(
            PathBuf::from("."),
            None,
            Some("  ".to_string()),
            &NpmrcConfig::default(),
        );
        assert_eq!(config.registry, DEFAULT_REGISTRY);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config::new(PathBuf::from(".")).with_concurrency(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_registry() {
        let config = Config::new(PathBuf::from(".")).with_registry("not a url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_token_not_serialized() {
        let mut config = Config::new(PathBuf::from("."));
        config.auth_token = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
