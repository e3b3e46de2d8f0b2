use std::path::PathBuf;
use thiserror::Error;

/// Core error type for tarn configuration and project discovery.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Project root not found from {start} (no package.json)")]
    ProjectNotFound { start: PathBuf },
}
