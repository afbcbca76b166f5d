//! Keystone CLI - Command-line interface for Keystone policy manifests.
//!
//! Provides commands to validate a manifest, describe per-role API contracts,
//! print scope filters and list notification routes.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use keystone_core::telemetry::{init_logging, LogFormat, LoggingConfig};

use commands::{config, describe, routes, scope, validate};
use output::OutputFormat;

/// Keystone - declarative authorization engine CLI
#[derive(Parser)]
#[command(
    name = "keystone",
    version = "0.1.0",
    about = "Keystone - declarative authorization and API-surface derivation",
    long_about = "CLI tool for validating policy manifests and inspecting the contracts they derive.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Emit engine logs at this level (e.g. debug)
    #[arg(long, global = true, env = "KEYSTONE_LOG")]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a manifest and report configuration errors
    Validate(validate::ValidateArgs),

    /// Print the API contract a role sees for a resource
    Describe(describe::DescribeArgs),

    /// Print the record filter a principal receives
    Scope(scope::ScopeArgs),

    /// List notification bindings and their template paths
    Routes(routes::RoutesArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config::load_value(config::LOG_LEVEL_KEY));
    if let Some(level) = log_level {
        let logging = LoggingConfig {
            level,
            format: LogFormat::Compact,
            include_location: false,
            ..LoggingConfig::default()
        };
        init_logging(&logging, "cli")?;
    }

    let format = cli.output;

    let result = match cli.command {
        Commands::Validate(args) => validate::execute(args, format),
        Commands::Describe(args) => describe::execute(args, format),
        Commands::Scope(args) => scope::execute(args, format),
        Commands::Routes(args) => routes::execute(args, format),
        Commands::Config(cmd) => config::execute(cmd, format),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
