//! Plan domain types for blockrun.
//!
//! A `Plan` is the declarative workflow definition: an ordered list of
//! `Node`s, a variable bag, a default `Policy`, and a layout hint used only
//! as a scheduling tie-break. YAML and JSON plan files both deserialize into
//! these structs; the core crate validates them before any execution.

use std::collections::BTreeMap;
use std::fmt;

use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat alias -> value mapping; the externally visible output of a run.
pub type ResultSet = Map<String, Value>;

/// Default worker pool width for a schedule level or a foreach node.
pub const DEFAULT_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The canonical plan definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier. Also the lookup key for subflow calls.
    pub id: String,
    /// Free-form version string (e.g. "1.0.0").
    #[serde(default = "default_plan_version")]
    pub version: String,
    /// Variable bag, addressed with `${vars.<path>}`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    /// Default execution policy for every node without an override.
    #[serde(default)]
    pub policy: Policy,
    /// UI layout hint: node ids in display order. Only a scheduling tie-break.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layout: Vec<String>,
    /// Ordered node list.
    #[serde(default)]
    pub nodes: Vec<Node>,
}

fn default_plan_version() -> String {
    "1".to_string()
}

impl Plan {
    /// Create an empty plan with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_plan_version(),
            vars: Map::new(),
            policy: Policy::default(),
            layout: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Position of a node in the layout hint, if present.
    pub fn layout_position(&self, id: &str) -> Option<usize> {
        self.layout.iter().position(|l| l == id)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single step: a capability invocation or a control construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the owning plan.
    pub id: String,
    /// Capability reference, `"<id>"` or `"<id>@<semver requirement>"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    /// Control tag. `none` for plain capability nodes.
    #[serde(default, skip_serializing_if = "ControlTag::is_none")]
    pub control: ControlTag,
    /// Input map: literal values or `${...}` placeholder expressions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    /// Output alias map: local output key -> externally published alias.
    ///
    /// When empty, every local key is published under its own name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    /// Optional guard. A false guard skips the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Guard>,
    /// Foreach loop spec (loop nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForeachSpec>,
    /// While loop spec (loop nodes only).
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_loop: Option<WhileSpec>,
    /// Loop body plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<Plan>>,
    /// Subflow call spec (subflow nodes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSpec>,
    /// Per-node policy override, merged field-wise onto the plan default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyOverride>,
}

impl Node {
    /// Create a plain capability node.
    pub fn capability(id: impl Into<String>, uses: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uses: Some(uses.into()),
            control: ControlTag::None,
            inputs: Map::new(),
            outputs: BTreeMap::new(),
            when: None,
            foreach: None,
            while_loop: None,
            body: None,
            call: None,
            policy: None,
        }
    }

    /// Effective policy for this node given the plan default.
    pub fn effective_policy(&self, default: &Policy) -> Policy {
        match &self.policy {
            Some(over) => default.merged(over),
            None => default.clone(),
        }
    }

    /// Publish a node's local outputs under their aliases.
    pub fn publish(&self, local: &Map<String, Value>) -> Map<String, Value> {
        if self.outputs.is_empty() {
            return local.clone();
        }
        let mut published = Map::new();
        for (key, alias) in &self.outputs {
            if let Some(value) = local.get(key) {
                published.insert(alias.clone(), value.clone());
            }
        }
        published
    }

    /// Parsed capability reference, if the node declares one.
    pub fn capability_ref(&self) -> Option<Result<CapabilityRef, CapabilityRefError>> {
        self.uses.as_deref().map(CapabilityRef::parse)
    }
}

/// Control construct tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlTag {
    #[default]
    None,
    Loop,
    Subflow,
}

impl ControlTag {
    pub fn is_none(&self) -> bool {
        matches!(self, ControlTag::None)
    }
}

/// A `when` guard.
///
/// `{expr: "..."}` is evaluated with the restricted expression grammar; any
/// other value is judged by its own truthiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Guard {
    Expr { expr: String },
    Literal(Value),
}

/// Foreach loop specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachSpec {
    /// Source collection: a placeholder string or a literal array.
    pub source: Value,
    /// Variable name the current element is bound to in the child's `vars`.
    #[serde(alias = "as")]
    pub item: String,
    /// Maximum concurrently running children (defaults to the policy width).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// While loop specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileSpec {
    /// Guard expression evaluated before each iteration.
    pub condition: String,
    /// Hard iteration cap. Must be positive.
    pub max_iterations: u32,
}

/// Subflow call specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    /// External plan id, resolved by the plan loader.
    pub plan: String,
    /// Caller inputs, resolved into the child's variable overrides.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// What to do when a node's capability fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the run and propagate the error.
    #[default]
    Halt,
    /// Accept an empty output for the node and proceed.
    Continue,
    /// Re-invoke up to `retries` more times, then halt.
    Retry,
}

/// Execution policy for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub on_error: OnError,
    /// Additional attempts after the first under `on_error = retry`.
    #[serde(default)]
    pub retries: u32,
    /// Worker pool width for levels and foreach children. Unset means the
    /// runner's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Per-invocation timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            on_error: OnError::Halt,
            retries: 0,
            concurrency: None,
            timeout_ms: None,
        }
    }
}

impl Policy {
    /// Apply a node-level override on top of this policy.
    pub fn merged(&self, over: &PolicyOverride) -> Policy {
        Policy {
            on_error: over.on_error.unwrap_or(self.on_error),
            retries: over.retries.unwrap_or(self.retries),
            concurrency: over.concurrency.or(self.concurrency),
            timeout_ms: over.timeout_ms.or(self.timeout_ms),
        }
    }

    /// Pool width, falling back to `default` when unset.
    pub fn width(&self, default: usize) -> usize {
        self.concurrency.unwrap_or(default).max(1)
    }

    /// Total attempts allowed for one node invocation.
    pub fn max_attempts(&self) -> u32 {
        match self.on_error {
            OnError::Retry => self.retries.saturating_add(1),
            OnError::Halt | OnError::Continue => 1,
        }
    }
}

/// Node-level policy override. Unset fields inherit the plan default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Capability reference
// ---------------------------------------------------------------------------

/// A parsed `uses:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRef {
    pub id: String,
    /// Version requirement; `None` selects the highest registered version.
    pub version: Option<VersionReq>,
}

/// Error parsing a capability reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid capability reference '{reference}': {reason}")]
pub struct CapabilityRefError {
    pub reference: String,
    pub reason: String,
}

impl CapabilityRef {
    /// Parse `"id"` or `"id@req"`.
    pub fn parse(reference: &str) -> Result<Self, CapabilityRefError> {
        let (id, version) = match reference.split_once('@') {
            Some((id, req)) => {
                let req = VersionReq::parse(req.trim()).map_err(|e| CapabilityRefError {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })?;
                (id.trim(), Some(req))
            }
            None => (reference.trim(), None),
        };
        if id.is_empty() {
            return Err(CapabilityRefError {
                reference: reference.to_string(),
                reason: "capability id must not be empty".to_string(),
            });
        }
        Ok(Self {
            id: id.to_string(),
            version,
        })
    }
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(req) => write!(f, "{}@{}", self.id, req),
            None => f.write_str(&self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
