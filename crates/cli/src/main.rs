//! Stream Analytics CLI
//!
//! Validates stream definitions, runs jobs over JSON-lines input and
//! inspects stored checkpoints.

mod commands;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use commands::{CheckpointsArgs, RunArgs, ValidateArgs};
use std::path::PathBuf;
use stream_analytics_config::EngineConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "stream-analytics",
    version,
    about = "Windowed stream aggregation over JSON event streams",
    long_about = "Runs stream definitions against JSON-lines input.\n\n\
                  A stream definition (YAML or JSON) describes filters, transforms,\n\
                  enrichments, windowed aggregations, alerts and the watermark,\n\
                  checkpoint and backpressure policies of one stream."
)]
struct Cli {
    /// Engine configuration file (YAML or JSON)
    #[arg(
        short,
        long,
        global = true,
        env = "STREAM_ANALYTICS_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stream definition and print a summary
    Validate(ValidateArgs),

    /// Run a stream definition over a JSON-lines input file
    Run(RunArgs),

    /// List checkpoints stored for a stream
    Checkpoints(CheckpointsArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let config = EngineConfig::load(cli.config.as_deref()).context("loading engine configuration")?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Validate(args) => args.execute(),
        Commands::Run(args) => args.execute(&config).await,
        Commands::Checkpoints(args) => args.execute(&config).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Logs go to stderr; stdout is reserved for results
fn init_tracing(config: &EngineConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("processor=debug,stream_analytics=debug,info")
        } else {
            EnvFilter::new(&config.observability.log_level)
        }
    });

    let (json, plain) = if config.observability.json_logging {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::parse_from([
            "stream-analytics",
            "--verbose",
            "run",
            "orders.yaml",
            "--input",
            "orders.jsonl",
            "--checkpoint-dir",
            "/tmp/ckpt",
            "--follow",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.spec, PathBuf::from("orders.yaml"));
                assert_eq!(args.input, PathBuf::from("orders.jsonl"));
                assert_eq!(args.checkpoint_dir, Some(PathBuf::from("/tmp/ckpt")));
                assert!(args.follow);
                assert!(args.output.is_none());
            }
            _ => panic!("expected run"),
        }
    }
}
