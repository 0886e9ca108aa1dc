//! Scribe CLI - batch benchmarking of local language models
//!
//! Manages benchmark templates and batches, runs batches against an external
//! inference backend and reports the results.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

mod commands;
mod config;
mod utils;

use commands::{
    batch::BatchCommand, results::ResultsCommand, template::TemplateCommand, Command,
};

#[derive(Parser)]
#[command(
    name = "scribe",
    version = env!("CARGO_PKG_VERSION"),
    about = "RebelSCRIBE model benchmarking CLI",
    long_about = "Create prompt templates, run them as batches across local models sequentially or in parallel, and compare latency, throughput, memory and quality."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "REBELSCRIBE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage benchmark templates
    #[command(name = "template", alias = "t")]
    Template(TemplateCommand),

    /// Manage and run batch benchmarks
    #[command(name = "batch", alias = "b")]
    Batch(BatchCommand),

    /// Inspect batch results
    #[command(name = "results", alias = "r")]
    Results(ResultsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    debug!("Scribe CLI v{} starting", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load(cli.config.as_deref())?;
    debug!("Configuration loaded: {:?}", config);

    let result = match &cli.command {
        Commands::Template(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Batch(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Results(cmd) => cmd.execute(&config, cli.json).await,
    };

    match result {
        Ok(_) => {
            if !cli.quiet {
                info!("Command completed successfully");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
