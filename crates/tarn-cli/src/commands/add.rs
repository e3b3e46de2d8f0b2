use super::install::print_report;
use miette::Result;
use tarn_core::paths;
use tarn_core::pkg::{add_package, InstallOptions, PackageSpec, RegistryClient};
use tarn_core::Config;
use tracing::debug;

/// Run `tarn add <spec> [version]`.
pub fn run(
    config: &Config,
    spec: &str,
    version: Option<&str>,
    dev: bool,
    global: bool,
) -> Result<()> {
    let spec = match PackageSpec::parse_with_version(spec, version) {
        Ok(spec) => spec,
        Err(e) => super::fail(&e, Some(spec), config.json_logs),
    };

    let options = if global {
        InstallOptions::global(&paths::global_dir())
    } else {
        InstallOptions::project(&super::project_root_or_fail(config, Some(&spec.name)))
    }
    .with_concurrency(config.concurrency);
    debug!(store = %options.store_root.display(), global, "Adding package");

    let client = match RegistryClient::from_config(config) {
        Ok(client) => client,
        Err(e) => super::fail(&e, Some(&spec.name), config.json_logs),
    };

    let runtime = super::runtime()?;
    let result = runtime.block_on(add_package(&client, &client, &spec, dev, options));

    match result {
        Ok(report) => print_report(&report, config.json_logs),
        Err(e) => super::fail(&e, Some(&spec.name), config.json_logs),
    }
}
