//! Read-only views over persisted runs: state and events.

use anyhow::{Context, Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use blockrun_core::event::EventSink;
use blockrun_core::repository::run_state::RunStateStore;
use blockrun_types::event::RunEvent;
use blockrun_types::run_state::{RunState, RunStatus};

use crate::state::AppState;

pub fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Suspended => "suspended",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

/// Type-specific fields of an event, without `type` and `node`, as compact JSON.
pub fn event_detail(event: &RunEvent) -> String {
    let Ok(Value::Object(mut fields)) = serde_json::to_value(&event.kind) else {
        return String::new();
    };
    fields.remove("type");
    fields.remove("node");
    if fields.is_empty() {
        String::new()
    } else {
        Value::Object(fields).to_string()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub async fn state(state: &AppState, plan_id: &str, run_id: &str, json: bool) -> Result<()> {
    let run = state
        .runner
        .store()
        .load(plan_id, run_id)
        .await
        .with_context(|| format!("Failed to read state of run '{run_id}'"))?
        .ok_or_else(|| anyhow!("No run '{run_id}' found for plan '{plan_id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} of '{}': {}",
        style(&run.run_id).cyan(),
        run.plan_id,
        style(status_label(run.status)).bold()
    );
    println!("  Updated: {}", run.updated_at.to_rfc3339());
    if let Some(pending) = &run.pending_ui {
        let marker = if pending.submitted { "submitted" } else { "waiting" };
        println!("  Pending input: node '{}' ({marker})", style(&pending.node_id).cyan());
    }

    let rows = node_rows(&run);
    if rows.is_empty() {
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Outputs"),
        ]);
    for (key, status, outputs) in rows {
        let status_cell = match status {
            "skipped" => Cell::new(status).fg(Color::Yellow),
            _ => Cell::new(status).fg(Color::Green),
        };
        table.add_row(vec![Cell::new(key), status_cell, Cell::new(outputs)]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// One row per settled node key: completed (with its replayable outputs) or skipped.
fn node_rows(run: &RunState) -> Vec<(String, &'static str, String)> {
    let mut rows: Vec<_> = run
        .success_nodes
        .iter()
        .map(|key| {
            let outputs = run
                .replay_outputs(key)
                .map(|o| Value::Object(o.clone()).to_string())
                .unwrap_or_default();
            (key.clone(), "completed", outputs)
        })
        .chain(
            run.skipped_nodes
                .iter()
                .map(|key| (key.clone(), "skipped", String::new())),
        )
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn events(state: &AppState, plan_id: &str, run_id: &str, node: Option<&str>, json: bool) -> Result<()> {
    let events: Vec<RunEvent> = state
        .event_log
        .read(plan_id, run_id)
        .with_context(|| format!("Failed to read event log of run '{run_id}'"))?
        .into_iter()
        .filter(|e| node.is_none() || e.node() == node)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!("  No events for run '{run_id}' of '{plan_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Time"),
            Cell::new("Type"),
            Cell::new("Node"),
            Cell::new("Detail"),
        ]);
    for event in &events {
        let kind = match event.type_name() {
            "node_error" | "failed" => Cell::new(event.type_name()).fg(Color::Red),
            "suspend" | "diagnostic" | "node_skipped" => Cell::new(event.type_name()).fg(Color::Yellow),
            other => Cell::new(other),
        };
        table.add_row(vec![
            Cell::new(event.seq),
            Cell::new(event.ts.format("%H:%M:%S%.3f")),
            kind,
            Cell::new(event.node().unwrap_or("-")),
            Cell::new(event_detail(event)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
