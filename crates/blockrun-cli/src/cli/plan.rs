//! Plan inspection commands: validate, levels, list.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use blockrun_core::plan::dag::DependencyGraph;
use blockrun_core::plan::definition::discover_plans;
use blockrun_types::plan::{ControlTag, Node, Plan};

use super::parse_vars;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn validate(state: &AppState, target: &str, dry_run: bool, vars: &[String], json: bool) -> Result<()> {
    let plan = state.load_plan(target)?;
    state
        .runner
        .validate(&plan)
        .with_context(|| format!("Plan '{}' failed validation", plan.id))?;

    let outcome = if dry_run {
        let vars = parse_vars(vars)?;
        Some(
            state
                .runner
                .dry_run(&plan, vars)
                .await
                .with_context(|| format!("Dry run of '{}' failed", plan.id))?,
        )
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "plan": plan.id,
            "valid": true,
            "nodes": plan.nodes.len(),
            "dry_run": outcome.as_ref().map(|o| serde_json::json!({
                "results": o.results,
                "skipped": o.skipped,
                "diagnostics": o.diagnostics.iter().map(|d| &d.message).collect::<Vec<_>>(),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Plan '{}' is valid ({} nodes)",
        style("*").green().bold(),
        style(&plan.id).cyan(),
        plan.nodes.len()
    );
    if let Some(outcome) = outcome {
        println!("  Dry run results: {}", serde_json::to_string(&outcome.results)?);
        for diagnostic in &outcome.diagnostics {
            println!("  {} {}", style("!").yellow().bold(), diagnostic.message);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

pub fn levels(state: &AppState, target: &str, json: bool) -> Result<()> {
    let plan = state.load_plan(target)?;
    let graph = DependencyGraph::build(&plan).with_context(|| format!("Plan '{}' has an invalid graph", plan.id))?;
    let levels = graph.levels();

    if json {
        let out: Vec<_> = levels
            .iter()
            .enumerate()
            .map(|(level, ids)| serde_json::json!({ "level": level, "nodes": ids }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Level").fg(Color::Cyan),
            Cell::new("Node"),
            Cell::new("Kind"),
            Cell::new("Depends on"),
        ]);

    for (level, ids) in levels.iter().enumerate() {
        for id in ids {
            let kind = plan.node(id).map(node_kind).unwrap_or_default();
            let deps = graph
                .dependencies(id)
                .map(|d| d.iter().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            table.add_row(vec![Cell::new(level), Cell::new(id), Cell::new(kind), Cell::new(deps)]);
        }
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn node_kind(node: &Node) -> String {
    match node.control {
        ControlTag::Loop if node.foreach.is_some() => "foreach".to_string(),
        ControlTag::Loop => "while".to_string(),
        ControlTag::Subflow => match &node.call {
            Some(call) => format!("subflow -> {}", call.plan),
            None => "subflow".to_string(),
        },
        ControlTag::None => node.uses.clone().unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub fn list(state: &AppState, json: bool) -> Result<()> {
    let plans_dir = state.loader.plans_dir();
    let plans: Vec<(std::path::PathBuf, Plan)> =
        discover_plans(plans_dir).with_context(|| format!("Failed to scan {}", plans_dir.display()))?;

    if json {
        let out: Vec<_> = plans
            .iter()
            .map(|(path, plan)| {
                serde_json::json!({
                    "id": plan.id,
                    "version": plan.version,
                    "nodes": plan.nodes.len(),
                    "path": path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if plans.is_empty() {
        println!();
        println!("  No plans found under {}.", plans_dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Nodes"),
            Cell::new("Path"),
        ]);
    for (path, plan) in &plans {
        let shown = path.strip_prefix(plans_dir).unwrap_or(path);
        table.add_row(vec![
            Cell::new(&plan.id),
            Cell::new(&plan.version),
            Cell::new(plan.nodes.len()),
            Cell::new(shown.display()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
