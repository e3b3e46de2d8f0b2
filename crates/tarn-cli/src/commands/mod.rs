pub mod add;
pub mod install;
pub mod remove;
pub mod version;

use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::PathBuf;
use tarn_core::paths;
use tarn_core::pkg::{ErrorInfo, PkgError};
use tarn_core::Config;

/// JSON envelope for a command that failed before producing a report.
#[derive(Serialize)]
struct FailureResult<'a> {
    ok: bool,
    error: ErrorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

/// Print a fatal package error and exit with status 1.
pub fn fail(err: &PkgError, name: Option<&str>, json: bool) -> ! {
    if json {
        let result = FailureResult {
            ok: false,
            error: ErrorInfo::from(err),
            name,
        };
        match serde_json::to_string_pretty(&result) {
            Ok(out) => println!("{out}"),
            Err(_) => println!("{{\"ok\":false}}"),
        }
    } else {
        eprintln!("error: {}: {}", err.code(), err.message());
    }
    std::process::exit(1);
}

/// The project containing the working directory, or a manifest error.
pub fn project_root_or_fail(config: &Config, name: Option<&str>) -> PathBuf {
    match paths::require_project_root(config.project_dir()) {
        Ok(root) => root,
        Err(e) => fail(&PkgError::manifest(e.to_string()), name, config.json_logs),
    }
}

/// Runtime for the async install paths.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
}
