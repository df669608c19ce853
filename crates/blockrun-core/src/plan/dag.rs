//! Dependency graph derived from `${node.alias}` references.
//!
//! Uses `petgraph` to model which nodes read which outputs. Topological sort
//! detects cycles before any execution. The graph is only an ordering hint:
//! loop data is known at runtime, so the scheduler re-checks readiness at
//! dispatch time and never trusts the levels alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use blockrun_types::plan::{Guard, Node, Plan};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;

use super::definition::PlanError;
use super::placeholder::{node_references, scan_text};

/// Every node id a node reads, in any position the scheduler resolves.
///
/// Covers inputs, the `call` inputs, the `foreach` source, the `while`
/// condition, the `when` guard, and (for loops) everything the body reads.
pub fn referenced_nodes(node: &Node) -> BTreeSet<String> {
    let mut refs = node_references(&Value::Object(node.inputs.clone()));
    if let Some(call) = &node.call {
        refs.extend(node_references(&Value::Object(call.inputs.clone())));
    }
    if let Some(foreach) = &node.foreach {
        refs.extend(node_references(&foreach.source));
    }
    if let Some(while_loop) = &node.while_loop {
        refs.extend(text_node_references(&while_loop.condition));
    }
    if let Some(guard) = &node.when {
        refs.extend(guard_references(guard));
    }
    if let Some(body) = &node.body {
        for inner in &body.nodes {
            refs.extend(referenced_nodes(inner));
        }
        for inner in &body.nodes {
            refs.remove(&inner.id);
        }
    }
    refs
}

/// Node ids referenced by a guard.
pub fn guard_references(guard: &Guard) -> BTreeSet<String> {
    match guard {
        Guard::Expr { expr } => text_node_references(expr),
        Guard::Literal(value) => node_references(value),
    }
}

fn text_node_references(text: &str) -> BTreeSet<String> {
    scan_text(text)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|r| r.node_id().map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Plan-local dependency graph: edge `upstream -> dependent`.
///
/// References to ids outside the plan (an enclosing plan's nodes, for loop
/// bodies) are not edges.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<String>,
    upstream: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph and reject cycles.
    pub fn build(plan: &Plan) -> Result<Self, PlanError> {
        let mut graph = DiGraph::<String, ()>::new();
        let mut index = HashMap::new();
        for node in &plan.nodes {
            index.insert(node.id.clone(), graph.add_node(node.id.clone()));
        }

        let mut upstream = BTreeMap::new();
        for node in &plan.nodes {
            let deps: BTreeSet<String> = referenced_nodes(node)
                .into_iter()
                .filter(|id| index.contains_key(id))
                .collect();
            for dep in &deps {
                graph.add_edge(index[dep.as_str()], index[node.id.as_str()], ());
            }
            upstream.insert(node.id.clone(), deps);
        }

        toposort(&graph, None).map_err(|cycle| {
            PlanError::CycleDetected(format!(
                "plan '{}': cycle involving node '{}'",
                plan.id,
                graph[cycle.node_id()]
            ))
        })?;

        Ok(Self {
            graph,
            index,
            order: plan.nodes.iter().map(|n| n.id.clone()).collect(),
            upstream,
        })
    }

    /// Plan-local nodes `id` reads from.
    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.upstream.get(id)
    }

    /// Number of distinct plan-local upstream nodes.
    pub fn in_degree(&self, id: &str) -> usize {
        self.index
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }

    /// Nodes grouped by in-degree, ascending; declaration order within a group.
    ///
    /// This is a snapshot heuristic: a node with in-degree 1 may still depend
    /// on a node in a later group. Readiness is re-verified at dispatch.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for id in &self.order {
            groups.entry(self.in_degree(id)).or_default().push(id.clone());
        }
        groups.into_values().collect()
    }

    /// Node ids in a valid topological order (declaration order tie-break).
    pub fn topological_order(&self) -> Vec<String> {
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut out = Vec::with_capacity(self.order.len());
        while out.len() < self.order.len() {
            let before = out.len();
            for id in &self.order {
                if placed.contains(id.as_str()) {
                    continue;
                }
                let ready = self.upstream[id].iter().all(|d| placed.contains(d.as_str()));
                if ready {
                    placed.insert(id);
                    out.push(id.clone());
                }
            }
            if out.len() == before {
                break;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
