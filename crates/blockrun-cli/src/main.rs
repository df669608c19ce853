//! blockrun CLI entry point.
//!
//! Binary name: `blockrun`
//!
//! Parses arguments, sets up tracing, wires the file-backed runner for the
//! selected workspace, then dispatches to a command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,blockrun_core=debug,blockrun_infra=debug",
        _ => "trace",
    };
    if let Err(e) = blockrun_observe::tracing_setup::init_tracing(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    blockrun_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(&cli.workspace).await?;

    match cli.command {
        Commands::Validate { plan, dry_run, vars } => {
            cli::plan::validate(&state, &plan, dry_run, &vars, cli.json).await
        }
        Commands::Levels { plan } => cli::plan::levels(&state, &plan, cli.json),
        Commands::List => cli::plan::list(&state, cli.json),
        Commands::Run { plan, run_id, vars } => {
            cli::run::run(&state, &plan, run_id, &vars, cli.json).await
        }
        Commands::Submit { plan_id, run_id, data } => {
            cli::run::submit(&state, &plan_id, &run_id, &data, cli.json).await
        }
        Commands::State { plan_id, run_id } => {
            cli::inspect::state(&state, &plan_id, &run_id, cli.json).await
        }
        Commands::Events { plan_id, run_id, node } => {
            cli::inspect::events(&state, &plan_id, &run_id, node.as_deref(), cli.json)
        }
    }
}
