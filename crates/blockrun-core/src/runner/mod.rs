//! Plan Runner: the dependency-driven scheduler and its public entry points.
//!
//! `PlanRunner` validates a plan, opens (or resumes) its durable run state
//! and event log, and drives the three-phase scheduler:
//!
//! 1. **Leveled pass** -- nodes grouped by dependency in-degree; interactive
//!    nodes run inline one at a time, computational nodes on a bounded pool.
//! 2. **Intra-level fixed point** -- deferred nodes re-scanned until a pass
//!    makes no progress.
//! 3. **Global fixed point** -- the whole plan re-scanned; anything still
//!    unresolved becomes a `diagnostic` event, not a failure.
//!
//! Loop and subflow nodes recurse into fresh scheduler executions that share
//! the root run id, event log and run state (under scoped keys).

mod loops;
pub mod plan_loader;
mod policy;
mod scheduler;
mod subflow;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use blockrun_types::config::RunnerConfig;
use blockrun_types::error::CapabilityError;
use blockrun_types::event::EventKind;
use blockrun_types::plan::{DEFAULT_CONCURRENCY, Node, Plan, ResultSet};
use blockrun_types::run_state::{PendingUi, RunState, RunStatus};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::capability::registry::CapabilityRegistry;
use crate::config_store::{ConfigStore, MapConfigStore};
use crate::event::{EventBus, EventEmitter, EventLogError, EventSink, MemoryEventSink};
use crate::plan::definition::{PlanError, validate_plan};
use crate::repository::run_state::{RunStateStore, StateStoreError};

use self::plan_loader::{MapPlanLoader, PlanLoader};
use self::scheduler::{Frame, FrameOutcome, RunContext};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("plan validation failed: {0}")]
    Validation(#[from] PlanError),

    #[error("node '{node}' failed: {source}")]
    Capability {
        node: String,
        source: CapabilityError,
    },

    #[error("node '{node}' timed out after {timeout_ms} ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("node '{node}': subflow depth {depth} exceeds maximum {max}")]
    SubflowDepthExceeded { node: String, depth: u32, max: u32 },

    #[error("node '{node}': plan '{plan}' not found")]
    PlanNotFound { node: String, plan: String },

    #[error("node '{node}': subflow plan '{plan}' is unusable: {source}")]
    InvalidSubflow {
        node: String,
        plan: String,
        source: PlanError,
    },

    #[error("worker task failed: {0}")]
    Join(String),
}

impl RunnerError {
    /// The node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            RunnerError::Capability { node, .. }
            | RunnerError::Timeout { node, .. }
            | RunnerError::SubflowDepthExceeded { node, .. }
            | RunnerError::PlanNotFound { node, .. }
            | RunnerError::InvalidSubflow { node, .. } => Some(node),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// Runner-wide settings, usually derived from `RunnerConfig`.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub workspace_root: PathBuf,
    /// Pool width when a plan's policy leaves `concurrency` unset.
    pub default_concurrency: usize,
    pub max_subflow_depth: u32,
    /// When `false`, unsubmitted interactive renders are accepted as-is
    /// instead of suspending the run.
    pub interactive_wait: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            default_concurrency: DEFAULT_CONCURRENCY,
            max_subflow_depth: 8,
            interactive_wait: true,
        }
    }
}

impl From<&RunnerConfig> for RunnerOptions {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            default_concurrency: config.default_concurrency,
            max_subflow_depth: config.max_subflow_depth,
            interactive_wait: config.interactive_wait,
        }
    }
}

/// A request to start or resume a run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Resume this run when state exists for it; otherwise start it fresh.
    /// A new UUID v7 is generated when absent.
    pub run_id: Option<String>,
    pub parent_run_id: Option<String>,
    /// Overrides merged onto the plan's variable bag.
    pub vars: Map<String, Value>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }
}

/// A node that never became resolvable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Scoped node key.
    pub node: String,
    /// Upstream node ids that never settled.
    pub waiting_on: Vec<String>,
    pub message: String,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    /// `Completed` or `Suspended`; halting failures are returned as errors.
    pub status: RunStatus,
    /// Every published alias of the root plan's settled nodes.
    pub results: ResultSet,
    pub pending: Option<PendingUi>,
    pub diagnostics: Vec<Diagnostic>,
    /// Scoped keys of guard-skipped nodes.
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// PlanRunner
// ---------------------------------------------------------------------------

/// Executes plans against a capability registry and a run state store.
///
/// Generic over `S: RunStateStore` for storage flexibility.
pub struct PlanRunner<S: RunStateStore> {
    registry: Arc<CapabilityRegistry>,
    store: Arc<S>,
    sink: Arc<dyn EventSink>,
    bus: Option<EventBus>,
    config_store: Arc<dyn ConfigStore>,
    plan_loader: Arc<dyn PlanLoader>,
    options: RunnerOptions,
}

impl<S: RunStateStore + 'static> PlanRunner<S> {
    pub fn new(registry: Arc<CapabilityRegistry>, store: Arc<S>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            store,
            sink,
            bus: None,
            config_store: Arc::new(MapConfigStore::default()),
            plan_loader: Arc::new(MapPlanLoader::new()),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_config_store(mut self, config_store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = config_store;
        self
    }

    pub fn with_plan_loader(mut self, plan_loader: Arc<dyn PlanLoader>) -> Self {
        self.plan_loader = plan_loader;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pre-execution validation against this runner's registry and config.
    ///
    /// Every subflow target reachable from `plan` (through loop bodies and
    /// nested subflows) is loaded and validated too. Each plan id is checked
    /// once, so recursive call graphs terminate. Targets the loader cannot
    /// find are left to the calling node's error policy at run time.
    pub fn validate(&self, plan: &Plan) -> Result<(), PlanError> {
        validate_plan(plan, &self.registry, self.config_store.as_ref())?;
        let mut visited = BTreeSet::from([plan.id.clone()]);
        self.validate_subflow_targets(&plan.nodes, &mut visited)
    }

    fn validate_subflow_targets(&self, nodes: &[Node], visited: &mut BTreeSet<String>) -> Result<(), PlanError> {
        for node in nodes {
            if let Some(body) = &node.body {
                self.validate_subflow_targets(&body.nodes, visited)?;
            }
            let Some(call) = &node.call else {
                continue;
            };
            if !visited.insert(call.plan.clone()) {
                continue;
            }
            let target = self
                .plan_loader
                .load(&call.plan)
                .map_err(|e| e.in_subflow(&call.plan))?;
            let Some(target) = target else {
                tracing::debug!(node = %node.id, plan = %call.plan, "subflow target not found during validation");
                continue;
            };
            validate_plan(&target, &self.registry, self.config_store.as_ref())
                .map_err(|e| e.in_subflow(&call.plan))?;
            self.validate_subflow_targets(&target.nodes, visited)?;
        }
        Ok(())
    }

    /// Start a new run, or resume `request.run_id` from its persisted state.
    ///
    /// Returns `Suspended` when an interactive node is waiting for input; a
    /// later call with the same run id continues from there. Halting
    /// failures emit a `failed` event, persist `status = failed`, and are
    /// returned as `Err`.
    pub async fn run(&self, plan: &Plan, request: RunRequest) -> Result<RunOutcome, RunnerError> {
        self.validate(plan)?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let existing = self.store.load(&plan.id, &run_id).await?;
        let resumed = existing.is_some();
        let mut state = existing.unwrap_or_else(|| RunState::new(&plan.id, &run_id));
        state.status = RunStatus::Running;

        let emitter = EventEmitter::open(self.sink.clone(), self.bus.clone(), &plan.id, &run_id)?;
        self.execute(plan, request, run_id, state, emitter, resumed, false)
            .await
    }

    /// Static pass over a plan without side effects.
    ///
    /// Computational nodes run their `dry_run` (empty outputs when they have
    /// none), interactive nodes are auto-submitted with empty outputs, and
    /// nothing is persisted. Events go to a throwaway in-memory log.
    pub async fn dry_run(&self, plan: &Plan, vars: Map<String, Value>) -> Result<RunOutcome, RunnerError> {
        self.validate(plan)?;
        let run_id = format!("dry-{}", uuid::Uuid::now_v7());
        let sink: Arc<dyn EventSink> = Arc::new(MemoryEventSink::new());
        let emitter = EventEmitter::open(sink, None, &plan.id, &run_id)?;
        let request = RunRequest {
            vars,
            ..RunRequest::default()
        };
        let state = RunState::new(&plan.id, &run_id);
        self.execute(plan, request, run_id, state, emitter, false, true)
            .await
    }

    /// Submit outputs for a suspended run's pending interaction.
    pub async fn submit(
        &self,
        plan_id: &str,
        run_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<RunState, RunnerError> {
        Ok(self.store.submit(plan_id, run_id, outputs).await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        plan: &Plan,
        request: RunRequest,
        run_id: String,
        state: RunState,
        emitter: EventEmitter,
        resumed: bool,
        dry_run: bool,
    ) -> Result<RunOutcome, RunnerError> {
        let started = Instant::now();
        let root_parent = request.parent_run_id.clone();
        let ctx = Arc::new(RunContext {
            registry: self.registry.clone(),
            store: self.store.clone(),
            config_store: self.config_store.clone(),
            plan_loader: self.plan_loader.clone(),
            options: self.options.clone(),
            run_id: run_id.clone(),
            emitter: emitter.clone(),
            state: tokio::sync::Mutex::new(state),
            interactive: tokio::sync::Mutex::new(()),
            suspension: std::sync::Mutex::new(None),
            diagnostics: std::sync::Mutex::new(Vec::new()),
            dry_run,
        });

        emitter.emit(&plan.id, root_parent.as_deref(), EventKind::Start { resumed })?;
        tracing::info!(plan = %plan.id, run_id = %run_id, resumed, dry_run, "run started");

        let mut vars = plan.vars.clone();
        vars.extend(request.vars);
        let frame = Frame::root(Arc::new(plan.clone()), vars, root_parent.clone());

        let outcome = ctx.clone().execute_boxed(frame).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(FrameOutcome::Completed(results)) => {
                ctx.persist(|s| s.status = RunStatus::Completed).await?;
                emitter.emit(
                    &plan.id,
                    root_parent.as_deref(),
                    EventKind::Finish {
                        status: "completed".to_string(),
                        elapsed_ms,
                    },
                )?;
                tracing::info!(plan = %plan.id, run_id = %run_id, elapsed_ms, "run completed");
                Ok(ctx.outcome(RunStatus::Completed, results).await)
            }
            Ok(FrameOutcome::Suspended(results)) => {
                ctx.persist(|s| s.status = RunStatus::Suspended).await?;
                emitter.emit(
                    &plan.id,
                    root_parent.as_deref(),
                    EventKind::Finish {
                        status: "suspended".to_string(),
                        elapsed_ms,
                    },
                )?;
                tracing::info!(plan = %plan.id, run_id = %run_id, elapsed_ms, "run suspended");
                Ok(ctx.outcome(RunStatus::Suspended, results).await)
            }
            Err(err) => {
                ctx.persist(|s| s.status = RunStatus::Failed).await?;
                emitter.emit(
                    &plan.id,
                    root_parent.as_deref(),
                    EventKind::Failed {
                        node: err.node().map(str::to_string),
                        error: err.to_string(),
                    },
                )?;
                tracing::error!(plan = %plan.id, run_id = %run_id, error = %err, "run failed");
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
