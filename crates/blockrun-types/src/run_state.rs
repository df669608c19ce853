//! Durable run state.
//!
//! One `RunState` exists per (plan id, run id). It records which nodes
//! completed, their published outputs for replay, and at most one pending
//! interaction. Nodes executed inside loop or subflow children are recorded
//! under a scoped key (see [`scoped_key`]) in the root run's state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of a persisted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Suspended,
    Completed,
    Failed,
}

/// A pending interaction: the run is suspended until it is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUi {
    /// Scoped node key of the interactive node.
    pub node_id: String,
    pub run_id: String,
    /// Inputs the node was rendered with.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub submitted: bool,
    /// Submitted outputs, once available.
    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,
}

/// Durable state for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub plan_id: String,
    pub run_id: String,
    #[serde(default)]
    pub status: RunStatus,
    /// Scoped keys of nodes that completed (including degraded completions).
    #[serde(default)]
    pub success_nodes: BTreeSet<String>,
    /// Scoped keys of nodes skipped by a false guard.
    #[serde(default)]
    pub skipped_nodes: BTreeSet<String>,
    #[serde(default)]
    pub pending_ui: Option<PendingUi>,
    /// Captured interactive outputs, replayed on resume.
    #[serde(default)]
    pub ui_outputs: BTreeMap<String, Map<String, Value>>,
    /// Published outputs of completed nodes, replayed on resume.
    #[serde(default)]
    pub node_outputs: BTreeMap<String, Map<String, Value>>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh state for a new run.
    pub fn new(plan_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            run_id: run_id.into(),
            status: RunStatus::Running,
            success_nodes: BTreeSet::new(),
            skipped_nodes: BTreeSet::new(),
            pending_ui: None,
            ui_outputs: BTreeMap::new(),
            node_outputs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Record a completed node and its published outputs.
    pub fn record_success(&mut self, key: &str, published: Map<String, Value>) {
        self.success_nodes.insert(key.to_string());
        self.node_outputs.insert(key.to_string(), published);
        self.updated_at = Utc::now();
    }

    /// Record a node skipped by its guard.
    pub fn record_skip(&mut self, key: &str) {
        self.skipped_nodes.insert(key.to_string());
        self.updated_at = Utc::now();
    }

    /// Replayable outputs for a completed node.
    ///
    /// Interactive captures take precedence over the generic output record.
    pub fn replay_outputs(&self, key: &str) -> Option<&Map<String, Value>> {
        if !self.success_nodes.contains(key) {
            return None;
        }
        self.ui_outputs
            .get(key)
            .or_else(|| self.node_outputs.get(key))
    }

    /// Whether the node at `key` has a terminal record (completed or skipped).
    pub fn is_settled(&self, key: &str) -> bool {
        self.success_nodes.contains(key) || self.skipped_nodes.contains(key)
    }
}

/// Build the state key for a node executed under `scope`.
///
/// The root run uses an empty scope, so its keys are the plain node ids.
pub fn scoped_key(scope: &str, node_id: &str) -> String {
    if scope.is_empty() {
        node_id.to_string()
    } else {
        format!("{scope}/{node_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialized_shape_has_required_fields() {
        let mut state = RunState::new("plan", "run-1");
        state.record_success("a", json!({"x": 1}).as_object().unwrap().clone());
        state.pending_ui = Some(PendingUi {
            node_id: "form".to_string(),
            run_id: "run-1".to_string(),
            inputs: Map::new(),
            submitted: false,
            outputs: None,
        });

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["success_nodes"], json!(["a"]));
        assert_eq!(value["pending_ui"]["node_id"], json!("form"));
        assert_eq!(value["pending_ui"]["submitted"], json!(false));
        assert!(value["ui_outputs"].is_object());
    }

    #[test]
    fn minimal_document_deserializes_with_defaults() {
        let state: RunState = serde_json::from_value(json!({
            "plan_id": "p",
            "run_id": "r",
            "success_nodes": ["a"],
            "pending_ui": null,
            "ui_outputs": {}
        }))
        .unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.success_nodes.contains("a"));
        assert!(state.node_outputs.is_empty());
    }

    #[test]
    fn replay_prefers_ui_outputs() {
        let mut state = RunState::new("p", "r");
        state.record_success("form", json!({"x": 1}).as_object().unwrap().clone());
        state
            .ui_outputs
            .insert("form".to_string(), json!({"x": 2}).as_object().unwrap().clone());
        assert_eq!(state.replay_outputs("form").unwrap()["x"], json!(2));
        assert!(state.replay_outputs("other").is_none());
    }

    #[test]
    fn skipped_and_completed_nodes_are_settled() {
        let mut state = RunState::new("p", "r");
        state.record_success("done", Map::new());
        state.record_skip("muted");
        assert!(state.is_settled("done"));
        assert!(state.is_settled("muted"));
        assert!(!state.is_settled("later"));
        assert!(state.replay_outputs("muted").is_none());
    }

    #[test]
    fn scoped_keys() {
        assert_eq!(scoped_key("", "a"), "a");
        assert_eq!(scoped_key("loop[2]", "a"), "loop[2]/a");
    }
}
