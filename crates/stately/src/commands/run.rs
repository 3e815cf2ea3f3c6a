//! Run command - executes one state machine in-process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::Args;
use serde_json::Value;

use stately_engine::ExecutionContext;

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Definitions file, JSON or YAML (overrides config)
    #[arg(short, long)]
    pub definitions: Option<PathBuf>,

    /// Machine name or key
    #[arg(short, long)]
    pub machine: String,

    /// Execution input as a JSON string
    #[arg(short, long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read the execution input from a JSON file
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// State to start at instead of StartAt
    #[arg(long)]
    pub start_at: Option<String>,
}

/// Run the run command.
///
/// Prints the execution result as JSON on stdout; a run that does not
/// succeed is reported as an error so the process exits non-zero.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let config = &ctx.config.config;
    let path = super::definitions_path(args.definitions, config)?;
    let definitions = super::load_definitions(&path)?;

    let (key, machine) = definitions.find(&args.machine).ok_or_else(|| {
        anyhow!(
            "no state machine named '{}' in {} (available: {})",
            args.machine,
            path.display(),
            definitions.keys().join(", ")
        )
    })?;

    let input = read_input(args.input, args.input_file)?;
    let machine_name = machine.name.as_deref().unwrap_or(key);
    let definition = Arc::new(machine.definition.clone());
    let start_at = args
        .start_at
        .unwrap_or_else(|| definition.start_at.clone());

    let executor = super::build_executor(config)?;
    let result = executor
        .run(ExecutionContext::new(machine_name, definition, start_at, input))
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_success() {
        bail!(
            "execution {} finished with status {:?}",
            result.execution_arn,
            result.status
        );
    }
    Ok(())
}

fn read_input(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading input from {}", path.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    serde_json::from_str(&raw).context("input is not valid JSON")
}
