//! Stately - a local interpreter for Amazon States Language workflows
//!
//! Main entry point for the Stately CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

mod commands;

use commands::{config, run, serve, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Stately - run Amazon States Language workflows locally
#[derive(Parser)]
#[command(name = "stately")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to use instead of the user and project config
    #[arg(long, global = true, env = "STATELY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the StartExecution HTTP endpoint
    Serve(serve::ServeArgs),

    /// Run one execution in-process and print its result
    Run(run::RunArgs),

    /// Check a definitions file
    Validate(validate::ValidateArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = commands::load_config(cli.config.as_deref())?;
    let logging = loaded.config.logging();

    // Console on stderr so `run` keeps stdout for the result document.
    let console_filter = if cli.verbose {
        "stately=debug,stately_engine=debug,stately_server=debug,stately_config=debug,info"
            .to_string()
    } else {
        logging.level.clone()
    };

    let (json_layer, _guard) = match &logging.json_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "stately.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "stately=trace,stately_engine=trace,stately_server=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(console_filter)),
        )
        .with(json_layer)
        .init();

    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let ctx = commands::Context {
        verbose: cli.verbose,
        config: loaded,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
