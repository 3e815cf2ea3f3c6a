//! Validate command - checks a definitions file.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::style;

use super::Context;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Definitions file, JSON or YAML (overrides config)
    #[arg(short, long)]
    pub definitions: Option<PathBuf>,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let path = super::definitions_path(args.definitions, &ctx.config.config)?;
    let definitions = super::load_definitions(&path)?;

    definitions.validate()?;

    for key in definitions.keys() {
        let Some((_, machine)) = definitions.find(key) else {
            continue;
        };
        let states = machine.definition.states.len();
        match &machine.name {
            Some(name) if ctx.verbose => println!(
                "  {} {key} ({name}, {states} states)",
                style("✓").green()
            ),
            _ => println!("  {} {key} ({states} states)", style("✓").green()),
        }
    }
    println!(
        "{} state machine(s) valid in {}",
        definitions.keys().len(),
        path.display()
    );

    Ok(())
}
