//! Event records for the run event stream.
//!
//! `RunEvent` is the unit appended to the per-run event log and broadcast on
//! the event bus. The envelope carries the sequencing fields; the `kind`
//! is flattened into the same JSON object, tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version stamped on every event record.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// One record of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Strictly increasing per run id; never reused.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    /// Id of the plan that emitted the event (child plans emit their own id).
    pub plan: String,
    pub run_id: String,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    pub schema: u32,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RunEvent {
    /// The `type` discriminator as written to the log.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// The node the event refers to, if any.
    pub fn node(&self) -> Option<&str> {
        self.kind.node()
    }
}

/// Type-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A run (or child run) began.
    Start {
        #[serde(default)]
        resumed: bool,
    },

    /// A node's capability (or control construct) is about to execute.
    NodeStart {
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
    },

    /// A node completed. `degraded` marks an empty output accepted under
    /// `on_error = continue`.
    NodeFinish {
        node: String,
        elapsed_ms: u64,
        attempts: u32,
        #[serde(default)]
        degraded: bool,
    },

    /// A node's guard evaluated false.
    NodeSkipped { node: String, reason: String },

    /// A node's outputs were restored from run state instead of recomputed.
    NodeReplayed { node: String },

    /// A capability failed or timed out.
    NodeError {
        node: String,
        error_code: String,
        recoverable: bool,
        message: String,
        #[serde(default)]
        details: Value,
        attempt: u32,
        will_retry: bool,
    },

    /// A loop node started one child run.
    LoopIteration { node: String, index: usize },

    /// The run suspended waiting for human input at `node`.
    Suspend { node: String },

    /// Non-fatal scheduling diagnostic: `node` never became resolvable.
    Diagnostic {
        node: String,
        waiting_on: Vec<String>,
        message: String,
    },

    /// The run finished (completed or suspended).
    Finish { status: String, elapsed_ms: u64 },

    /// The run halted on an unrecoverable error.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<String>,
        error: String,
    },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Start { .. } => "start",
            EventKind::NodeStart { .. } => "node_start",
            EventKind::NodeFinish { .. } => "node_finish",
            EventKind::NodeSkipped { .. } => "node_skipped",
            EventKind::NodeReplayed { .. } => "node_replayed",
            EventKind::NodeError { .. } => "node_error",
            EventKind::LoopIteration { .. } => "loop_iteration",
            EventKind::Suspend { .. } => "suspend",
            EventKind::Diagnostic { .. } => "diagnostic",
            EventKind::Finish { .. } => "finish",
            EventKind::Failed { .. } => "failed",
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            EventKind::NodeStart { node, .. }
            | EventKind::NodeFinish { node, .. }
            | EventKind::NodeSkipped { node, .. }
            | EventKind::NodeReplayed { node }
            | EventKind::NodeError { node, .. }
            | EventKind::LoopIteration { node, .. }
            | EventKind::Suspend { node }
            | EventKind::Diagnostic { node, .. } => Some(node),
            EventKind::Failed { node, .. } => node.as_deref(),
            EventKind::Start { .. } | EventKind::Finish { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finish_event() -> RunEvent {
        RunEvent {
            seq: 7,
            ts: Utc::now(),
            plan: "p".to_string(),
            run_id: "r".to_string(),
            parent_run_id: None,
            schema: EVENT_SCHEMA_VERSION,
            kind: EventKind::NodeFinish {
                node: "a".to_string(),
                elapsed_ms: 12,
                attempts: 3,
                degraded: false,
            },
        }
    }

    #[test]
    fn envelope_and_kind_share_one_object() {
        let value = serde_json::to_value(finish_event()).unwrap();
        assert_eq!(value["type"], json!("node_finish"));
        assert_eq!(value["seq"], json!(7));
        assert_eq!(value["node"], json!("a"));
        assert_eq!(value["attempts"], json!(3));
        assert_eq!(value["schema"], json!(EVENT_SCHEMA_VERSION));
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn log_line_parses_back() {
        let line = serde_json::to_string(&finish_event()).unwrap();
        let parsed: RunEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.type_name(), "node_finish");
        assert_eq!(parsed.node(), Some("a"));
    }

    #[test]
    fn type_names_match_serde_tags() {
        let kind = EventKind::Diagnostic {
            node: "b".to_string(),
            waiting_on: vec!["a".to_string()],
            message: "unresolved".to_string(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], json!(kind.type_name()));
    }
}
