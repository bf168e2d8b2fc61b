//! CLI commands for webext-host.
//!
//! Developer tooling: validate a manifest, describe a started extension.

pub mod describe;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "webext-host")]
#[command(about = "WebExtension lifecycle runtime", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: the platform config directory)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an unpacked extension's manifest
    Validate(PackageArgs),

    /// Start an extension against in-memory services and print its descriptor
    Describe(PackageArgs),
}

#[derive(Args)]
pub struct PackageArgs {
    /// Path to the unpacked extension (default: current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Extension id, overriding the one in the manifest
    #[arg(long)]
    pub id: Option<String>,

    /// Treat the package as temporarily installed
    #[arg(long)]
    pub temporary: bool,

    /// Treat the package as privileged (signed by the vendor)
    #[arg(long)]
    pub privileged: bool,
}

/// Parse arguments and run the selected command.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => crate::config::RuntimeConfig::load_from(path)?,
        None => crate::config::RuntimeConfig::load(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Validate(args) => runtime.block_on(validate::run_validate(&args, &config)),
        Commands::Describe(args) => runtime.block_on(describe::run_describe(&args, config)),
    }
}
