//! Config command - configuration inspection.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration as TOML
    Show,

    /// Show which config files are loaded and their precedence
    Which,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.config;

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
    }

    let server = loaded.config.server();
    let sqs = loaded.config.sqs();
    println!("# server: {}:{}", server.bind, server.port);
    println!("# sqs transport: {:?}", sqs.transport);
    println!();
    print!("{}", loaded.config.to_toml()?);

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    let loaded = &ctx.config;

    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            style("✓ loaded").green()
        } else {
            style("· not found").dim()
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Create ./stately.toml to configure handlers.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    for warning in &loaded.warnings {
        println!("{} {}", style("warning:").yellow(), warning);
    }

    Ok(())
}
