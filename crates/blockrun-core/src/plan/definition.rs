//! Plan parsing, pre-execution validation, and filesystem operations.
//!
//! Converts YAML/JSON files into the canonical `Plan` type and validates
//! everything that can be known before a run starts: id uniqueness, alias
//! uniqueness, reference targets, cycles, guard grammar, required `env.*`
//! and `config.*` values, capability resolution, and loop/subflow shape.
//! Nothing checked here is ever rediscovered as a runtime fault.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use blockrun_types::plan::{ControlTag, Guard, Node, Plan, Policy, PolicyOverride};
use serde_json::Value;
use thiserror::Error;

use crate::capability::registry::CapabilityRegistry;
use crate::config_store::ConfigStore;

use super::dag::DependencyGraph;
use super::expression::check_syntax;
use super::placeholder::{RESERVED_SCOPES, Reference, scan_references, scan_text};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Validation-time errors. Always raised before any node executes.
#[derive(Debug, Error)]
pub enum PlanError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A placeholder names a node or alias that does not exist.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    /// Guard or while condition outside the restricted grammar.
    #[error("expression error: {0}")]
    Expression(String),

    #[error("node '{node}' requires environment variable '{name}'")]
    MissingEnv { node: String, name: String },

    #[error("node '{node}' requires config key '{path}'")]
    MissingConfig { node: String, path: String },

    #[error("node '{node}': {reason}")]
    UnknownCapability { node: String, reason: String },

    /// A subflow target failed to load or validate.
    #[error("subflow plan '{plan}': {source}")]
    Subflow {
        plan: String,
        #[source]
        source: Box<PlanError>,
    },
}

impl PlanError {
    /// Attribute this error to the subflow target `plan`.
    pub fn in_subflow(self, plan: impl Into<String>) -> Self {
        PlanError::Subflow {
            plan: plan.into(),
            source: Box::new(self),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML plan. Does not validate (validation needs a registry).
pub fn parse_plan_yaml(yaml: &str) -> Result<Plan, PlanError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))
}

/// Parse a JSON plan. Does not validate.
pub fn parse_plan_json(json: &str) -> Result<Plan, PlanError> {
    serde_json::from_str(json).map_err(|e| PlanError::Parse(e.to_string()))
}

pub fn serialize_plan_yaml(plan: &Plan) -> Result<String, PlanError> {
    serde_yaml_ng::to_string(plan).map_err(|e| PlanError::Parse(e.to_string()))
}

/// Load a plan file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_plan_file(path: &Path) -> Result<Plan, PlanError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_plan_json(&content),
        _ => parse_plan_yaml(&content),
    }
}

/// Discover all plan files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_plans(base_dir: &Path) -> Result<Vec<(PathBuf, Plan)>, PlanError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, Plan)>) -> Result<(), PlanError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_plan = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if is_plan {
            match load_plan_file(&path) {
                Ok(plan) => results.push((path, plan)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable plan file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Run every pre-execution check on `plan` and its loop bodies.
///
/// Subflow targets need a plan loader; `PlanRunner::validate` walks them.
pub fn validate_plan(
    plan: &Plan,
    registry: &CapabilityRegistry,
    config: &dyn ConfigStore,
) -> Result<(), PlanError> {
    validate_scope(plan, &BTreeSet::new(), registry, config)
}

fn validate_scope(
    plan: &Plan,
    ancestors: &BTreeSet<String>,
    registry: &CapabilityRegistry,
    config: &dyn ConfigStore,
) -> Result<(), PlanError> {
    if plan.id.trim().is_empty() {
        return Err(PlanError::Validation("plan id must not be empty".to_string()));
    }
    check_policy(&plan.policy, &format!("plan '{}'", plan.id))?;

    let mut ids = BTreeSet::new();
    for node in &plan.nodes {
        check_node_id(&node.id)?;
        if ancestors.contains(&node.id) {
            return Err(PlanError::Validation(format!(
                "node '{}' in plan '{}' shadows a node of an enclosing plan",
                node.id, plan.id
            )));
        }
        if !ids.insert(node.id.clone()) {
            return Err(PlanError::DuplicateNode(node.id.clone()));
        }
    }

    let mut aliases: HashMap<&str, &str> = HashMap::new();
    for node in &plan.nodes {
        for alias in node.outputs.values() {
            if let Some(other) = aliases.insert(alias.as_str(), node.id.as_str()) {
                return Err(PlanError::Validation(format!(
                    "alias '{alias}' is published by both '{other}' and '{}'",
                    node.id
                )));
            }
        }
    }

    for node in &plan.nodes {
        check_shape(node)?;
        if let Some(over) = &node.policy {
            check_override(over, &node.id)?;
        }
        if let Some(reference) = node.capability_ref() {
            let reference = reference.map_err(|e| PlanError::UnknownCapability {
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
            registry
                .resolve(&reference)
                .map_err(|e| PlanError::UnknownCapability {
                    node: node.id.clone(),
                    reason: e.to_string(),
                })?;
        }
        check_references(node, plan, ancestors, config)?;

        if let Some(Guard::Expr { expr }) = &node.when {
            check_syntax(expr)
                .map_err(|e| PlanError::Expression(format!("node '{}': {e}", node.id)))?;
        }
        if let Some(while_loop) = &node.while_loop {
            check_syntax(&while_loop.condition)
                .map_err(|e| PlanError::Expression(format!("node '{}': {e}", node.id)))?;
        }

        if let Some(body) = &node.body {
            let mut visible = ancestors.clone();
            visible.extend(ids.iter().cloned());
            validate_scope(body, &visible, registry, config)?;
        }
    }

    DependencyGraph::build(plan)?;
    Ok(())
}

fn check_node_id(id: &str) -> Result<(), PlanError> {
    if id.is_empty() {
        return Err(PlanError::Validation("node id must not be empty".to_string()));
    }
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(PlanError::Validation(format!(
            "node id '{id}' contains invalid characters (alphanumeric, '-' and '_' allowed)"
        )));
    }
    if RESERVED_SCOPES.contains(&id) {
        return Err(PlanError::Validation(format!(
            "node id '{id}' is a reserved placeholder scope"
        )));
    }
    Ok(())
}

fn check_policy(policy: &Policy, owner: &str) -> Result<(), PlanError> {
    if policy.concurrency == Some(0) {
        return Err(PlanError::Validation(format!("{owner}: concurrency must be >= 1")));
    }
    if policy.timeout_ms == Some(0) {
        return Err(PlanError::Validation(format!("{owner}: timeout_ms must be > 0")));
    }
    Ok(())
}

fn check_override(over: &PolicyOverride, node_id: &str) -> Result<(), PlanError> {
    if over.concurrency == Some(0) {
        return Err(PlanError::Validation(format!(
            "node '{node_id}': concurrency must be >= 1"
        )));
    }
    if over.timeout_ms == Some(0) {
        return Err(PlanError::Validation(format!(
            "node '{node_id}': timeout_ms must be > 0"
        )));
    }
    Ok(())
}

fn check_shape(node: &Node) -> Result<(), PlanError> {
    let invalid = |msg: &str| Err(PlanError::Validation(format!("node '{}': {msg}", node.id)));
    let has_loop_fields = node.foreach.is_some() || node.while_loop.is_some() || node.body.is_some();

    match node.control {
        ControlTag::None => {
            if node.uses.is_none() {
                return invalid("capability node requires 'uses'");
            }
            if has_loop_fields || node.call.is_some() {
                return invalid("capability node cannot declare loop or subflow fields");
            }
        }
        ControlTag::Loop => {
            if node.uses.is_some() || node.call.is_some() {
                return invalid("loop node cannot declare 'uses' or 'call'");
            }
            if node.body.is_none() {
                return invalid("loop node requires a 'body' plan");
            }
            match (&node.foreach, &node.while_loop) {
                (Some(foreach), None) => {
                    if foreach.item.trim().is_empty() {
                        return invalid("foreach requires an item variable name");
                    }
                    if foreach.max_concurrency == Some(0) {
                        return invalid("foreach max_concurrency must be >= 1");
                    }
                }
                (None, Some(while_loop)) => {
                    if while_loop.max_iterations == 0 {
                        return invalid("while max_iterations must be positive");
                    }
                }
                _ => return invalid("loop node requires exactly one of 'foreach' or 'while'"),
            }
        }
        ControlTag::Subflow => {
            if node.uses.is_some() || has_loop_fields {
                return invalid("subflow node cannot declare 'uses' or loop fields");
            }
            match &node.call {
                Some(call) if !call.plan.trim().is_empty() => {}
                _ => return invalid("subflow node requires 'call.plan'"),
            }
        }
    }
    Ok(())
}

/// Aliases a node is statically known to publish, if knowable.
fn known_aliases(node: &Node) -> Option<BTreeSet<&str>> {
    if !node.outputs.is_empty() {
        return Some(node.outputs.values().map(String::as_str).collect());
    }
    match node.control {
        ControlTag::Loop => Some(BTreeSet::from(["collect"])),
        ControlTag::None | ControlTag::Subflow => None,
    }
}

fn check_references(
    node: &Node,
    plan: &Plan,
    ancestors: &BTreeSet<String>,
    config: &dyn ConfigStore,
) -> Result<(), PlanError> {
    let mut refs = scan_references(&Value::Object(node.inputs.clone()));
    if let Some(call) = &node.call {
        refs.extend(scan_references(&Value::Object(call.inputs.clone())));
    }
    if let Some(foreach) = &node.foreach {
        refs.extend(scan_references(&foreach.source));
    }
    if let Some(while_loop) = &node.while_loop {
        refs.extend(scan_text(&while_loop.condition));
    }
    match &node.when {
        Some(Guard::Expr { expr }) => refs.extend(scan_text(expr)),
        Some(Guard::Literal(value)) => refs.extend(scan_references(value)),
        None => {}
    }

    for reference in refs {
        let reference = reference
            .map_err(|msg| PlanError::Validation(format!("node '{}': {msg}", node.id)))?;
        match reference {
            Reference::Vars(_) => {}
            Reference::Env(name) => {
                if std::env::var(&name).is_err() {
                    return Err(PlanError::MissingEnv {
                        node: node.id.clone(),
                        name,
                    });
                }
            }
            Reference::Config(path) => {
                if config.get(&path).is_none() {
                    return Err(PlanError::MissingConfig {
                        node: node.id.clone(),
                        path,
                    });
                }
            }
            Reference::Node {
                node: target, alias, ..
            } => {
                if let Some(upstream) = plan.node(&target) {
                    if let Some(known) = known_aliases(upstream) {
                        if !known.contains(alias.as_str()) {
                            return Err(PlanError::UnknownReference(format!(
                                "node '{}' reads '{target}.{alias}' but '{target}' publishes {:?}",
                                node.id, known
                            )));
                        }
                    }
                } else if !ancestors.contains(&target) {
                    return Err(PlanError::UnknownReference(format!(
                        "node '{}' references unknown node '{target}'",
                        node.id
                    )));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
