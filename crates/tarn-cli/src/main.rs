#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::fn_params_excessive_bools)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use tarn_core::Config;

#[derive(Parser, Debug)]
#[command(name = "tarn")]
#[command(author, version, about = "A small npm-compatible package installer", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Registry base URL (overrides TARN_REGISTRY and .npmrc)
    #[arg(long, global = true, value_name = "URL")]
    registry: Option<String>,

    /// Maximum simultaneous downloads
    #[arg(long, global = true, value_name = "N")]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Add a package to the project (or globally)
    Add {
        /// Package spec: name, name@version or @scope/name@version
        spec: String,

        /// Version expression, overriding any version in the spec
        version: Option<String>,

        /// Save to devDependencies
        #[arg(short = 'D', long)]
        dev: bool,

        /// Install into the global directory without touching the project
        #[arg(short, long)]
        global: bool,
    },

    /// Install every dependency declared in package.json
    Install,

    /// Remove a package from node_modules, package.json and the lockfile
    Remove {
        /// Package name
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::load(cwd, cli.registry)
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);
    if let Some(concurrency) = cli.concurrency {
        config = config.with_concurrency(concurrency);
    }
    config.validate().into_diagnostic()?;

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(),
        Some(Commands::Add {
            spec,
            version,
            dev,
            global,
        }) => commands::add::run(&config, &spec, version.as_deref(), dev, global),
        Some(Commands::Install) => commands::install::run(&config),
        Some(Commands::Remove { name }) => commands::remove::run(&config, &name),
    }
}
