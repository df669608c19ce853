//! CLI command definitions for the `blockrun` binary.
//!
//! Uses clap derive macros. Plan arguments accept either a path to a plan
//! file or a plan id looked up under the workspace's plans directory.

pub mod inspect;
pub mod plan;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

/// Run declarative plans of capability blocks.
#[derive(Parser)]
#[command(name = "blockrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace root holding `blockrun.toml`, plans and run state.
    #[arg(long, short = 'w', global = true, env = "BLOCKRUN_WORKSPACE", default_value = ".")]
    pub workspace: PathBuf,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all logging except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry to stdout.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a plan without running it.
    Validate {
        /// Plan file path or plan id.
        plan: String,

        /// Also execute a side-effect-free dry run.
        #[arg(long)]
        dry_run: bool,

        /// Variable override for the dry run (`key=value`, value parsed as JSON when possible).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Show the scheduling levels of a plan.
    Levels {
        /// Plan file path or plan id.
        plan: String,
    },

    /// List plans under the workspace's plans directory.
    #[command(alias = "ls")]
    List,

    /// Start a run, or resume one by id.
    Run {
        /// Plan file path or plan id.
        plan: String,

        /// Run id to start or resume (generated when omitted).
        #[arg(long)]
        run_id: Option<String>,

        /// Variable override (`key=value`, value parsed as JSON when possible).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Submit data for a suspended run's pending interaction.
    Submit {
        /// Plan id of the suspended run.
        plan_id: String,

        /// Run id of the suspended run.
        #[arg(long)]
        run_id: String,

        /// Submitted outputs as a JSON object.
        #[arg(long)]
        data: String,
    },

    /// Show the persisted state of a run.
    State {
        /// Plan id.
        plan_id: String,

        /// Run id.
        #[arg(long)]
        run_id: String,
    },

    /// Show the event log of a run.
    Events {
        /// Plan id.
        plan_id: String,

        /// Run id.
        #[arg(long)]
        run_id: String,

        /// Only events for this node key.
        #[arg(long)]
        node: Option<String>,
    },
}

/// Parse repeated `key=value` arguments into a variable bag.
///
/// Values that parse as JSON keep their type; anything else is a string.
pub fn parse_vars(raw: &[String]) -> Result<Map<String, Value>> {
    let mut vars = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid --var '{entry}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --var '{entry}': empty key");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

/// Parse a `--data` argument that must be a JSON object.
pub fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("Invalid JSON data")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {other}"),
    }
}
