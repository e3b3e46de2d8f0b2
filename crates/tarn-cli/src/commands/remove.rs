use miette::Result;
use serde::Serialize;
use tarn_core::pkg::{remove_package, RemoveReport};
use tarn_core::Config;

#[derive(Serialize)]
struct RemoveResult<'a> {
    ok: bool,
    #[serde(flatten)]
    report: &'a RemoveReport,
}

/// Run `tarn remove <name>`.
pub fn run(config: &Config, name: &str) -> Result<()> {
    let root = super::project_root_or_fail(config, Some(name));

    let report = match remove_package(&root, name) {
        Ok(report) => report,
        Err(e) => super::fail(&e, Some(name), config.json_logs),
    };

    if config.json_logs {
        let out = RemoveResult {
            ok: true,
            report: &report,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
        );
        return Ok(());
    }

    println!("- {}", report.name);
    for warning in &report.warnings {
        eprintln!("! {}: {}", warning.code, warning.message);
    }
    Ok(())
}
