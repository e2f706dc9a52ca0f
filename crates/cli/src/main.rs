//! nightrun CLI - Main Entry Point
//!
//! Compiles e2e sources, optionally serves the app, starts the browser driver
//! and runs the test runner, once or on every compile cycle.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;

use commands::{check, resolve, run, targets};

/// nightrun - browser e2e pipeline runner
#[derive(Parser)]
#[command(name = "nightrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Log line format
    #[arg(long, env = "NIGHTRUN_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the e2e pipeline
    Run(run::RunArgs),

    /// List dev-server targets
    Targets(targets::TargetsArgs),

    /// Print the base URL a dev-server target serves on
    ResolveUrl(resolve::ResolveArgs),

    /// Validate the compiler and test-runner configs
    Check(check::CheckArgs),
}

fn init_logging(verbose: bool, format: LogFormat) {
    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Run(args) => {
            if !run::execute(args).await? {
                std::process::exit(1);
            }
        }
        Commands::Targets(args) => targets::execute(args, cli.format)?,
        Commands::ResolveUrl(args) => resolve::execute(args, cli.format).await?,
        Commands::Check(args) => check::execute(args, cli.format)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test_case(&["nightrun", "targets"] ; "targets")]
    #[test_case(&["nightrun", "resolve-url", "app:serve"] ; "resolve url")]
    #[test_case(&["nightrun", "--format", "json", "check", "--compiler-config", "a.json", "--runner-config", "b.json"] ; "check")]
    #[test_case(&["nightrun", "run", "--compiler-config", "a.json", "--runner-config", "b.json", "--watch", "-v"] ; "run")]
    fn test_parses(argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_ok());
    }

    #[test]
    fn test_run_requires_configs() {
        assert!(Cli::try_parse_from(["nightrun", "run", "--watch"]).is_err());
    }
}
