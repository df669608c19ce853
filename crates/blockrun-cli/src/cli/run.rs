//! Run lifecycle commands: run (start or resume) and submit.

use anyhow::{Context, Result};
use console::style;
use tokio::sync::broadcast::error::TryRecvError;

use blockrun_core::runner::{RunOutcome, RunRequest};
use blockrun_types::event::RunEvent;
use blockrun_types::run_state::RunStatus;

use super::inspect::{event_detail, status_label};
use super::{parse_object, parse_vars};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(state: &AppState, target: &str, run_id: Option<String>, vars: &[String], json: bool) -> Result<()> {
    let plan = state.load_plan(target)?;
    let mut request = RunRequest::new();
    request.run_id = run_id;
    request.vars = parse_vars(vars)?;

    let mut events = state.bus.subscribe();
    let result = state.runner.run(&plan, request).await;

    // The runner publishes synchronously, so everything is buffered by now.
    let mut timeline = Vec::new();
    let mut lagged = 0;
    loop {
        match events.try_recv() {
            Ok(event) => timeline.push(event),
            Err(TryRecvError::Lagged(n)) => lagged += n,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    if lagged > 0 {
        tracing::warn!(lagged, "event bus overflowed; timeline is incomplete");
    }

    if !json {
        print_timeline(&timeline);
    }
    let outcome = result.with_context(|| format!("Run of plan '{}' failed", plan.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
        return Ok(());
    }

    print_outcome(&plan.id, &outcome)?;
    Ok(())
}

fn outcome_json(outcome: &RunOutcome) -> serde_json::Value {
    serde_json::json!({
        "run_id": outcome.run_id,
        "status": status_label(outcome.status),
        "results": outcome.results,
        "pending": outcome.pending,
        "skipped": outcome.skipped,
        "diagnostics": outcome.diagnostics.iter().map(|d| serde_json::json!({
            "node": d.node,
            "waiting_on": d.waiting_on,
            "message": d.message,
        })).collect::<Vec<_>>(),
    })
}

fn print_timeline(events: &[RunEvent]) {
    if events.is_empty() {
        return;
    }
    println!();
    for event in events {
        let kind = match event.type_name() {
            "node_error" | "failed" => style(event.type_name()).red(),
            "suspend" | "diagnostic" | "node_skipped" => style(event.type_name()).yellow(),
            "finish" => style(event.type_name()).green(),
            other => style(other).dim(),
        };
        println!(
            "  {:>4}  {:<15} {:<24} {}",
            event.seq,
            kind,
            event.node().unwrap_or("-"),
            style(event_detail(event)).dim()
        );
    }
}

fn print_outcome(plan_id: &str, outcome: &RunOutcome) -> Result<()> {
    println!();
    let marker = match outcome.status {
        RunStatus::Suspended => style("||").yellow().bold(),
        _ => style("*").green().bold(),
    };
    println!(
        "  {} Run {} of '{}' {}",
        marker,
        style(&outcome.run_id).cyan(),
        plan_id,
        status_label(outcome.status)
    );
    if !outcome.results.is_empty() {
        println!();
        for line in serde_json::to_string_pretty(&outcome.results)?.lines() {
            println!("  {line}");
        }
    }
    if !outcome.skipped.is_empty() {
        println!();
        println!("  Skipped: {}", outcome.skipped.join(", "));
    }
    for diagnostic in &outcome.diagnostics {
        println!("  {} {}", style("!").yellow().bold(), diagnostic.message);
    }
    if let Some(pending) = &outcome.pending {
        println!();
        println!("  Waiting for input at node '{}'.", style(&pending.node_id).cyan());
        println!(
            "  Submit with: {}",
            style(format!(
                "blockrun submit {plan_id} --run-id {} --data '{{...}}'",
                outcome.run_id
            ))
            .dim()
        );
        println!(
            "  Then resume: {}",
            style(format!("blockrun run {plan_id} --run-id {}", outcome.run_id)).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

pub async fn submit(state: &AppState, plan_id: &str, run_id: &str, data: &str, json: bool) -> Result<()> {
    let outputs = parse_object(data)?;
    let updated = state
        .runner
        .submit(plan_id, run_id, outputs)
        .await
        .with_context(|| format!("Failed to submit to run '{run_id}' of '{plan_id}'"))?;

    let node = updated
        .pending_ui
        .as_ref()
        .map(|p| p.node_id.clone())
        .unwrap_or_default();

    if json {
        let out = serde_json::json!({
            "plan": plan_id,
            "run_id": run_id,
            "node": node,
            "submitted": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Submitted input for node '{}'",
        style("*").green().bold(),
        style(&node).cyan()
    );
    println!(
        "  Resume with: {}",
        style(format!("blockrun run {plan_id} --run-id {run_id}")).dim()
    );
    println!();
    Ok(())
}
