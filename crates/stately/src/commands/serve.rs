//! Serve command - runs the StartExecution HTTP endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::{info, warn};

use stately_server::{AppState, Server, ServerConfig};

use super::Context;

/// Arguments for the serve command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Definitions file, JSON or YAML (overrides config)
    #[arg(short, long)]
    pub definitions: Option<PathBuf>,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config.config;
    let server_section = config.server();

    let port = args.port.unwrap_or(server_section.port);
    let bind = args.bind.unwrap_or(server_section.bind);
    let bind_address: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;

    let path = super::definitions_path(args.definitions, config)?;
    let definitions = super::load_definitions(&path)?;
    if let Err(e) = definitions.validate() {
        warn!(path = %path.display(), error = %e, "Definitions failed validation");
    }

    let executor = super::build_executor(config)?;

    info!(
        definitions = %path.display(),
        machines = ?definitions.keys(),
        verbose = ctx.verbose,
        "Loaded state machines"
    );

    let server_config = ServerConfig::new().with_bind_address(bind_address);
    let state = AppState::new(executor, definitions, server_config);
    Server::from_state(state).run().await?;

    Ok(())
}
