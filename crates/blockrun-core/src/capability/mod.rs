//! Capability contracts implemented by concrete step implementations.
//!
//! Two flavors exist. Computational capabilities transform inputs into
//! outputs and may run concurrently. Interactive capabilities render a form
//! or widget and report whether a human has submitted it; the scheduler runs
//! them one at a time and suspends the run when nothing was submitted.
//!
//! Both traits use RPITIT. The `box_capability` module provides the
//! object-safe wrappers the registry stores.

pub mod box_capability;
pub mod registry;

use std::path::PathBuf;

use blockrun_types::error::CapabilityError;
use semver::Version;
use serde_json::{Map, Value};

/// Which contract a registered capability implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Computational,
    Interactive,
}

/// Identity of an interactive widget across suspend/resume.
///
/// Collaborators key persisted widget state by this triple instead of any
/// ambient session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetKey {
    pub plan_id: String,
    pub node_id: String,
    pub capability_version: Version,
}

/// Per-invocation context handed to a capability.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub workspace_root: PathBuf,
    /// The invoking plan's variables plus `__plan_id` and `__node_id`.
    pub variables: Map<String, Value>,
    pub widget_key: WidgetKey,
    /// Outputs a human submitted for this node, when resuming a suspended
    /// interaction. Always `None` for computational capabilities.
    pub submission: Option<Map<String, Value>>,
}

impl InvocationContext {
    pub fn plan_id(&self) -> &str {
        &self.widget_key.plan_id
    }

    pub fn node_id(&self) -> &str {
        &self.widget_key.node_id
    }
}

/// Result of rendering an interactive capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOutput {
    pub outputs: Map<String, Value>,
    /// `false` tells the scheduler to suspend the run.
    pub submitted: bool,
}

impl RenderOutput {
    pub fn submitted(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            submitted: true,
        }
    }

    pub fn pending(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            submitted: false,
        }
    }
}

/// A step that computes outputs from inputs.
///
/// Implementations should be deterministic for fixed inputs unless they
/// document otherwise.
pub trait ComputationalCapability: Send + Sync {
    fn run(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<Map<String, Value>, CapabilityError>> + Send;

    /// Side-effect-free preview returning shape-compatible outputs.
    ///
    /// The default returns an empty map.
    fn dry_run(
        &self,
        _inputs: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<Map<String, Value>, CapabilityError>> + Send {
        async { Ok(Map::new()) }
    }
}

/// A step that needs a human.
pub trait InteractiveCapability: Send + Sync {
    fn render(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<RenderOutput, CapabilityError>> + Send;
}
