use miette::Result;
use serde::Serialize;
use tarn_core::pkg::{install_project, InstallOptions, InstallReport, RegistryClient};
use tarn_core::Config;

#[derive(Serialize)]
struct InstallResult<'a> {
    ok: bool,
    fetched: usize,
    #[serde(flatten)]
    report: &'a InstallReport,
}

/// Run `tarn install`.
pub fn run(config: &Config) -> Result<()> {
    let root = super::project_root_or_fail(config, None);
    let options = InstallOptions::project(&root).with_concurrency(config.concurrency);

    let client = match RegistryClient::from_config(config) {
        Ok(client) => client,
        Err(e) => super::fail(&e, None, config.json_logs),
    };

    let runtime = super::runtime()?;
    match runtime.block_on(install_project(&client, &client, options)) {
        Ok(report) => print_report(&report, config.json_logs),
        Err(e) => super::fail(&e, None, config.json_logs),
    }
}

/// Print an install report and exit with status 2 if any root failed.
pub fn print_report(report: &InstallReport, json: bool) -> Result<()> {
    if json {
        let out = InstallResult {
            ok: !report.has_failures(),
            fetched: report.fetched(),
            report,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        print_report_human(report);
    }

    if report.has_failures() {
        std::process::exit(2);
    }
    Ok(())
}

fn print_report_human(report: &InstallReport) {
    for pkg in &report.installed {
        let suffix = if pkg.dev { " (dev)" } else { "" };
        println!("+ {}@{}{suffix}", pkg.name, pkg.version);
    }

    for skipped in &report.skipped {
        match &skipped.required_by {
            Some(parent) => eprintln!(
                "! {}@{} (from {parent}): {} {}",
                skipped.name, skipped.version_expr, skipped.error.code, skipped.error.message
            ),
            None => eprintln!(
                "! {}@{}: {} {}",
                skipped.name, skipped.version_expr, skipped.error.code, skipped.error.message
            ),
        }
    }

    for conflict in &report.conflicts {
        eprintln!(
            "! {}: kept {}, ignored {} ({})",
            conflict.name, conflict.kept_version, conflict.resolved_version, conflict.requested
        );
    }

    for warning in &report.warnings {
        eprintln!("! {}: {}", warning.code, warning.message);
    }

    for root in report.failed_roots() {
        if let Some(error) = &root.error {
            eprintln!(
                "! {}@{}: {} {}",
                root.name, root.version_expr, error.code, error.message
            );
        }
    }

    let failed = report.failed_roots().count();
    if failed == 0 {
        println!(
            "Installed {} package(s), {} shared",
            report.installed.len(),
            report.deduplicated
        );
    } else {
        eprintln!(
            "Installed {} package(s); {failed} of {} root(s) failed",
            report.installed.len(),
            report.roots.len()
        );
    }
}
