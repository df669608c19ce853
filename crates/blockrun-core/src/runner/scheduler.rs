//! The three-phase scheduler over one plan execution (a "frame").
//!
//! A root run is one frame; every loop iteration and subflow call is a
//! nested frame driven by the same code through [`RunContext::execute_boxed`].
//! All frames of a run share one `RunContext`: the run id, the event
//! emitter, the persisted `RunState` (keyed by scoped node keys), the
//! interactive lock, and the suspension slot.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use blockrun_types::error::CapabilityError;
use blockrun_types::event::EventKind;
use blockrun_types::plan::{ControlTag, Guard, Node, Plan, Policy, ResultSet};
use blockrun_types::run_state::{PendingUi, RunState, RunStatus, scoped_key};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capability::box_capability::{BoxComputationalCapability, BoxInteractiveCapability};
use crate::capability::registry::{Capability, CapabilityRegistry, ResolvedCapability};
use crate::capability::{CapabilityKind, InvocationContext, RenderOutput, WidgetKey};
use crate::config_store::ConfigStore;
use crate::event::EventEmitter;
use crate::plan::dag::{DependencyGraph, referenced_nodes};
use crate::plan::definition::PlanError;
use crate::plan::expression::{evaluate_guard, truthy};
use crate::plan::placeholder::{OutputTable, Resolver, node_references};
use crate::repository::run_state::RunStateStore;

use super::plan_loader::PlanLoader;
use super::policy::{NodeEvents, absorb_failure, enforce};
use super::{Diagnostic, RunOutcome, RunnerError, RunnerOptions};

pub(super) type FrameFuture = Pin<Box<dyn Future<Output = Result<FrameOutcome, RunnerError>> + Send>>;

// ---------------------------------------------------------------------------
// Shared run context
// ---------------------------------------------------------------------------

pub(super) struct RunContext<S: RunStateStore> {
    pub registry: Arc<CapabilityRegistry>,
    pub store: Arc<S>,
    pub config_store: Arc<dyn ConfigStore>,
    pub plan_loader: Arc<dyn PlanLoader>,
    pub options: RunnerOptions,
    pub run_id: String,
    pub emitter: EventEmitter,
    pub state: tokio::sync::Mutex<RunState>,
    /// Held while an interactive node renders; interactive nodes never overlap.
    pub interactive: tokio::sync::Mutex<()>,
    /// The first interaction that asked to suspend the run.
    pub suspension: Mutex<Option<PendingUi>>,
    pub diagnostics: Mutex<Vec<Diagnostic>>,
    pub dry_run: bool,
}

/// One plan execution: the root plan, a loop iteration, or a subflow call.
#[derive(Clone)]
pub(super) struct Frame {
    pub plan: Arc<Plan>,
    /// Prefix for state keys; empty for the root frame.
    pub scope: String,
    pub parent_run_id: Option<String>,
    pub vars: Map<String, Value>,
    pub outputs: OutputTable,
    /// Subflow nesting depth.
    pub depth: u32,
}

impl Frame {
    pub fn root(plan: Arc<Plan>, vars: Map<String, Value>, parent_run_id: Option<String>) -> Self {
        Self {
            plan,
            scope: String::new(),
            parent_run_id,
            vars,
            outputs: OutputTable::new(),
            depth: 0,
        }
    }

    pub fn child(
        plan: Arc<Plan>,
        scope: String,
        parent_run_id: String,
        vars: Map<String, Value>,
        outputs: OutputTable,
        depth: u32,
    ) -> Self {
        Self {
            plan,
            scope,
            parent_run_id: Some(parent_run_id),
            vars,
            outputs,
            depth,
        }
    }

    fn key(&self, node_id: &str) -> String {
        scoped_key(&self.scope, node_id)
    }

    /// Published outputs of every settled node, merged in declaration order.
    fn results(&self) -> ResultSet {
        let mut results = ResultSet::new();
        for node in &self.plan.nodes {
            if let Some(published) = self.outputs.local(&node.id) {
                results.extend(published.clone());
            }
        }
        results
    }
}

pub(super) enum FrameOutcome {
    Completed(ResultSet),
    /// An interactive node is waiting; carries the results computed so far.
    Suspended(ResultSet),
}

/// A node that finished (possibly degraded) and is ready to be recorded.
pub(super) struct NodeDone {
    pub outputs: Map<String, Value>,
    pub attempts: u32,
    pub degraded: bool,
    pub interactive: bool,
    pub started: Instant,
}

impl NodeDone {
    pub fn new(outputs: Map<String, Value>, attempts: u32, started: Instant) -> Self {
        Self {
            outputs,
            attempts,
            degraded: false,
            interactive: false,
            started,
        }
    }

    pub fn degraded(attempts: u32, started: Instant) -> Self {
        Self {
            outputs: Map::new(),
            attempts,
            degraded: true,
            interactive: false,
            started,
        }
    }
}

/// Result of running a node inline.
pub(super) enum Inline {
    Done(NodeDone),
    Suspended,
}

struct Deferred {
    id: String,
    waiting_on: BTreeSet<String>,
}

/// Resolved inputs of a node that can run now.
pub(super) struct Ready {
    pub inputs: Map<String, Value>,
    pub foreach_source: Option<Value>,
    pub call_inputs: Map<String, Value>,
}

enum Readiness {
    Waiting(BTreeSet<String>),
    Skip(String),
    /// A guard failed to evaluate; routed through the node's policy.
    Failed(CapabilityError),
    Ready(Ready),
}

// ---------------------------------------------------------------------------
// Frame execution
// ---------------------------------------------------------------------------

impl<S: RunStateStore + 'static> RunContext<S> {
    /// Boxed entry point so frames can recurse through loops and subflows.
    pub fn execute_boxed(self: Arc<Self>, frame: Frame) -> FrameFuture {
        Box::pin(async move { self.execute_frame(frame).await })
    }

    async fn execute_frame(self: Arc<Self>, mut frame: Frame) -> Result<FrameOutcome, RunnerError> {
        let graph = DependencyGraph::build(&frame.plan)?;
        let events = NodeEvents::new(
            self.emitter.clone(),
            frame.plan.id.clone(),
            frame.parent_run_id.clone(),
        );

        // Phase A + B: leveled pass with an intra-level fixed point.
        for (level, ids) in graph.levels().into_iter().enumerate() {
            let mut pending = self.order(&frame.plan, ids);
            let mut pass = 0;
            while !pending.is_empty() && !self.is_suspended() {
                pass += 1;
                tracing::debug!(
                    plan = %frame.plan.id,
                    scope = %frame.scope,
                    level,
                    pass,
                    nodes = pending.len(),
                    "dispatching level"
                );
                let deferred = self.dispatch(&mut frame, &events, &pending).await?;
                let progressed = deferred.len() < pending.len();
                pending = deferred.into_iter().map(|d| d.id).collect();
                if !progressed {
                    break;
                }
            }
        }

        // Phase C: global fixed point over everything still unsettled.
        let mut pass = 0;
        loop {
            if self.is_suspended() {
                break;
            }
            let unsettled: Vec<String> = frame
                .plan
                .nodes
                .iter()
                .filter(|n| !frame.outputs.contains_local(&n.id))
                .map(|n| n.id.clone())
                .collect();
            if unsettled.is_empty() {
                break;
            }
            pass += 1;
            tracing::debug!(plan = %frame.plan.id, scope = %frame.scope, pass, nodes = unsettled.len(), "global fixed-point pass");

            let ordered = self.order(&frame.plan, unsettled);
            let deferred = self.dispatch(&mut frame, &events, &ordered).await?;
            if deferred.len() == ordered.len() && !self.is_suspended() {
                for stuck in deferred {
                    self.report_unresolved(&frame, &events, stuck)?;
                }
                break;
            }
        }

        let results = frame.results();
        if self.is_suspended() {
            Ok(FrameOutcome::Suspended(results))
        } else {
            Ok(FrameOutcome::Completed(results))
        }
    }

    /// Level ordering: interactive nodes first, then layout position, then
    /// declaration order.
    fn order(&self, plan: &Plan, ids: Vec<String>) -> Vec<String> {
        let mut keyed: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let declared = plan.nodes.iter().position(|n| n.id == id).unwrap_or(usize::MAX);
                let interactive = plan.node(&id).is_some_and(|n| self.is_interactive(n));
                let layout = plan.layout_position(&id).unwrap_or(usize::MAX);
                ((!interactive, layout, declared), id)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    fn is_interactive(&self, node: &Node) -> bool {
        node.control == ControlTag::None
            && self
                .resolve_capability(node)
                .is_ok_and(|c| c.kind() == CapabilityKind::Interactive)
    }

    fn resolve_capability(&self, node: &Node) -> Result<ResolvedCapability, PlanError> {
        let reference = node
            .capability_ref()
            .ok_or_else(|| PlanError::UnknownCapability {
                node: node.id.clone(),
                reason: "capability node has no 'uses'".to_string(),
            })?
            .map_err(|e| PlanError::UnknownCapability {
                node: node.id.clone(),
                reason: e.to_string(),
            })?;
        self.registry
            .resolve(&reference)
            .map_err(|e| PlanError::UnknownCapability {
                node: node.id.clone(),
                reason: e.to_string(),
            })
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run every ready node among `ids` once. Returns the nodes that could
    /// not run yet.
    ///
    /// Interactive nodes run inline, one at a time, in `ids` order.
    /// Computational nodes run on the frame's bounded pool. Loop and subflow
    /// nodes drive nested frames on the same join set without taking a pool
    /// permit, so they never hold back the siblings that follow them.
    async fn dispatch(
        self: &Arc<Self>,
        frame: &mut Frame,
        events: &NodeEvents,
        ids: &[String],
    ) -> Result<Vec<Deferred>, RunnerError> {
        let width = frame.plan.policy.width(self.options.default_concurrency);
        let pool = Arc::new(Semaphore::new(width));
        let mut workers: JoinSet<(String, Result<Inline, RunnerError>)> = JoinSet::new();
        let mut deferred = Vec::new();

        for id in ids {
            if self.is_suspended() {
                break;
            }
            let Some(node) = frame.plan.node(id).cloned() else {
                continue;
            };
            let key = frame.key(id);
            if self.try_replay(frame, events, &node, &key).await? {
                continue;
            }

            let policy = node.effective_policy(&frame.plan.policy);
            let ready = match self.prepare(frame, &node) {
                Readiness::Waiting(waiting_on) => {
                    tracing::debug!(node = %key, waiting_on = ?waiting_on, "deferring node");
                    deferred.push(Deferred {
                        id: id.clone(),
                        waiting_on,
                    });
                    continue;
                }
                Readiness::Skip(reason) => {
                    self.skip(frame, events, &node, &key, reason).await?;
                    continue;
                }
                Readiness::Failed(error) => {
                    let cause = RunnerError::Capability {
                        node: key.clone(),
                        source: error.clone(),
                    };
                    absorb_failure(events, &key, &policy, error, cause)?;
                    self.settle(frame, events, &node, &key, NodeDone::degraded(1, Instant::now()))
                        .await?;
                    continue;
                }
                Readiness::Ready(ready) => ready,
            };

            let inline = match node.control {
                ControlTag::Loop | ControlTag::Subflow => {
                    let ctx = Arc::clone(self);
                    let snapshot = frame.clone();
                    let events = events.clone();
                    let id = id.clone();
                    workers.spawn(async move {
                        let result = if node.control == ControlTag::Loop {
                            ctx.run_loop(&snapshot, &events, &node, &key, &policy, ready).await
                        } else {
                            ctx.run_subflow(&snapshot, &events, &node, &key, &policy, ready).await
                        };
                        (id, result)
                    });
                    continue;
                }
                ControlTag::None => {
                    let resolved = self.resolve_capability(&node)?;
                    match resolved.capability.clone() {
                        Capability::Interactive(cap) => Some(
                            self.run_interactive(frame, events, &node, &key, &policy, &resolved, cap, ready.inputs)
                                .await?,
                        ),
                        Capability::Computational(cap) => {
                            let job = ComputationalJob {
                                events: events.clone(),
                                key: key.clone(),
                                policy,
                                capability: cap,
                                label: format!("{}@{}", resolved.id, resolved.version),
                                context: self.invocation_context(frame, &node, &key, &resolved, None),
                                inputs: ready.inputs,
                                dry_run: self.dry_run,
                            };
                            let pool = pool.clone();
                            let id = id.clone();
                            workers.spawn(async move {
                                let result = match pool.acquire_owned().await {
                                    Ok(_permit) => job.run().await.map(Inline::Done),
                                    Err(e) => Err(RunnerError::Join(e.to_string())),
                                };
                                (id, result)
                            });
                            None
                        }
                    }
                }
            };

            match inline {
                Some(Inline::Done(done)) => self.settle(frame, events, &node, &key, done).await?,
                Some(Inline::Suspended) | None => {}
            }
        }

        while let Some(joined) = workers.join_next().await {
            let (id, result) = joined.map_err(|e| RunnerError::Join(e.to_string()))?;
            let done = match result {
                Ok(Inline::Done(done)) => done,
                Ok(Inline::Suspended) => continue,
                Err(err) => {
                    workers.abort_all();
                    return Err(err);
                }
            };
            let Some(node) = frame.plan.node(&id).cloned() else {
                continue;
            };
            let key = frame.key(&id);
            self.settle(frame, events, &node, &key, done).await?;
        }

        Ok(deferred)
    }

    /// Restore a node recorded by an earlier invocation of this run.
    async fn try_replay(
        &self,
        frame: &mut Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
    ) -> Result<bool, RunnerError> {
        let replayed = {
            let state = self.state.lock().await;
            if let Some(outputs) = state.replay_outputs(key) {
                Some(outputs.clone())
            } else if state.skipped_nodes.contains(key) {
                Some(Map::new())
            } else {
                None
            }
        };
        let Some(outputs) = replayed else {
            return Ok(false);
        };
        frame.outputs.insert(node.id.clone(), outputs);
        events.emit(EventKind::NodeReplayed { node: key.to_string() })?;
        tracing::debug!(node = %key, "replayed node from run state");
        Ok(true)
    }

    /// Check dependencies, evaluate the guard, and resolve inputs.
    fn prepare(&self, frame: &Frame, node: &Node) -> Readiness {
        let waiting: BTreeSet<String> = referenced_nodes(node)
            .into_iter()
            .filter(|id| !frame.outputs.contains(id))
            .collect();
        if !waiting.is_empty() {
            return Readiness::Waiting(waiting);
        }

        let resolver = Resolver::new(&frame.vars, &frame.outputs, self.config_store.as_ref());

        if let Some(guard) = &node.when {
            let pass = match guard {
                Guard::Expr { expr } => match evaluate_guard(expr, &resolver, "null") {
                    Ok(pass) => pass,
                    Err(e) => {
                        return Readiness::Failed(
                            CapabilityError::fatal("expression_error", e.to_string())
                                .with_details(json!({ "expr": expr })),
                        );
                    }
                },
                Guard::Literal(value) => match resolver.resolve(value) {
                    Ok(value) => truthy(&value),
                    Err(p) => return Readiness::Waiting(BTreeSet::from([p.node])),
                },
            };
            if !pass {
                let reason = match guard {
                    Guard::Expr { expr } => format!("guard '{expr}' is false"),
                    Guard::Literal(_) => "guard is false".to_string(),
                };
                return Readiness::Skip(reason);
            }
        }

        let inputs = match resolver.resolve_map(&node.inputs) {
            Ok(inputs) => inputs,
            Err(p) => return Readiness::Waiting(BTreeSet::from([p.node])),
        };

        let foreach_source = match &node.foreach {
            Some(spec) => match resolver.resolve(&spec.source) {
                Ok(Value::Null) => return Readiness::Waiting(node_references(&spec.source)),
                Ok(source) => Some(source),
                Err(p) => return Readiness::Waiting(BTreeSet::from([p.node])),
            },
            None => None,
        };

        let call_inputs = match &node.call {
            Some(call) => match resolver.resolve_map(&call.inputs) {
                Ok(inputs) => inputs,
                Err(p) => return Readiness::Waiting(BTreeSet::from([p.node])),
            },
            None => Map::new(),
        };

        Readiness::Ready(Ready {
            inputs,
            foreach_source,
            call_inputs,
        })
    }

    async fn skip(
        &self,
        frame: &mut Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        reason: String,
    ) -> Result<(), RunnerError> {
        frame.outputs.insert(node.id.clone(), Map::new());
        self.persist(|state| state.record_skip(key)).await?;
        events.emit(EventKind::NodeSkipped {
            node: key.to_string(),
            reason: reason.clone(),
        })?;
        tracing::debug!(node = %key, %reason, "node skipped");
        Ok(())
    }

    /// Publish, persist and announce a finished node.
    pub(super) async fn settle(
        &self,
        frame: &mut Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        done: NodeDone,
    ) -> Result<(), RunnerError> {
        let published = node.publish(&done.outputs);
        frame.outputs.insert(node.id.clone(), published.clone());

        let interactive = done.interactive;
        self.persist(|state| {
            if interactive {
                state.ui_outputs.insert(key.to_string(), published.clone());
            }
            if state.pending_ui.as_ref().is_some_and(|p| p.node_id == key) {
                state.pending_ui = None;
            }
            state.record_success(key, published);
        })
        .await?;

        let elapsed_ms = done.started.elapsed().as_millis() as u64;
        events.emit(EventKind::NodeFinish {
            node: key.to_string(),
            elapsed_ms,
            attempts: done.attempts,
            degraded: done.degraded,
        })?;
        tracing::debug!(node = %key, elapsed_ms, attempts = done.attempts, degraded = done.degraded, "node finished");
        Ok(())
    }

    fn report_unresolved(&self, frame: &Frame, events: &NodeEvents, stuck: Deferred) -> Result<(), RunnerError> {
        let key = frame.key(&stuck.id);
        let waiting_on: Vec<String> = stuck.waiting_on.into_iter().collect();
        let message = if waiting_on.is_empty() {
            format!("node '{}' never became resolvable", stuck.id)
        } else {
            format!(
                "node '{}' never became resolvable; waiting on {}",
                stuck.id,
                waiting_on.join(", ")
            )
        };
        events.emit(EventKind::Diagnostic {
            node: key.clone(),
            waiting_on: waiting_on.clone(),
            message: message.clone(),
        })?;
        tracing::warn!(node = %key, ?waiting_on, "unresolved node reported as diagnostic");
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Diagnostic {
                node: key,
                waiting_on,
                message,
            });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Interactive nodes
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_interactive(
        &self,
        frame: &Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        policy: &Policy,
        resolved: &ResolvedCapability,
        capability: Arc<BoxInteractiveCapability>,
        inputs: Map<String, Value>,
    ) -> Result<Inline, RunnerError> {
        let _turn = self.interactive.lock().await;
        if self.is_suspended() {
            return Ok(Inline::Suspended);
        }

        let started = Instant::now();
        events.emit(EventKind::NodeStart {
            node: key.to_string(),
            capability: Some(format!("{}@{}", resolved.id, resolved.version)),
        })?;

        if self.dry_run {
            let mut done = NodeDone::new(Map::new(), 1, started);
            done.interactive = true;
            return Ok(Inline::Done(done));
        }

        let submission = {
            let state = self.state.lock().await;
            state
                .pending_ui
                .as_ref()
                .filter(|p| p.node_id == key && p.submitted)
                .and_then(|p| p.outputs.clone())
        };

        let context = self.invocation_context(frame, node, key, resolved, submission.clone());
        let enforced = enforce(events, key, policy, || capability.render(&context, &inputs)).await?;
        let Some(rendered) = enforced.value else {
            let mut done = NodeDone::degraded(enforced.attempts, started);
            done.interactive = true;
            return Ok(Inline::Done(done));
        };

        let outputs = match (rendered, submission) {
            (RenderOutput { outputs, submitted: true }, _) => outputs,
            (_, Some(submitted)) => submitted,
            (RenderOutput { outputs, .. }, None) if !self.options.interactive_wait => outputs,
            (_, None) => {
                self.suspend(events, key, inputs).await?;
                return Ok(Inline::Suspended);
            }
        };

        let mut done = NodeDone::new(outputs, enforced.attempts, started);
        done.interactive = true;
        Ok(Inline::Done(done))
    }

    /// Persist a pending interaction and mark the run suspended. Only the
    /// first suspension of a run is recorded.
    async fn suspend(&self, events: &NodeEvents, key: &str, inputs: Map<String, Value>) -> Result<(), RunnerError> {
        let pending = PendingUi {
            node_id: key.to_string(),
            run_id: self.run_id.clone(),
            inputs,
            submitted: false,
            outputs: None,
        };
        {
            let mut slot = self.suspension.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(pending.clone());
        }

        self.persist(|state| {
            state.pending_ui = Some(pending);
            state.status = RunStatus::Suspended;
        })
        .await?;
        events.emit(EventKind::Suspend { node: key.to_string() })?;
        tracing::info!(node = %key, run_id = %self.run_id, "waiting for input, run suspended");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    pub(super) fn invocation_context(
        &self,
        frame: &Frame,
        node: &Node,
        key: &str,
        resolved: &ResolvedCapability,
        submission: Option<Map<String, Value>>,
    ) -> InvocationContext {
        let mut variables = frame.vars.clone();
        variables.insert("__plan_id".to_string(), json!(frame.plan.id));
        variables.insert("__node_id".to_string(), json!(node.id));
        InvocationContext {
            run_id: self.run_id.clone(),
            parent_run_id: frame.parent_run_id.clone(),
            workspace_root: self.options.workspace_root.clone(),
            variables,
            widget_key: WidgetKey {
                plan_id: frame.plan.id.clone(),
                node_id: key.to_string(),
                capability_version: resolved.version.clone(),
            },
            submission,
        }
    }

    /// Mutate the run state under its lock and save it (dry runs skip the save).
    pub(super) async fn persist(&self, update: impl FnOnce(&mut RunState) + Send) -> Result<(), RunnerError> {
        let mut state = self.state.lock().await;
        update(&mut state);
        state.updated_at = chrono::Utc::now();
        if !self.dry_run {
            self.store.save(&state).await?;
        }
        Ok(())
    }

    pub(super) async fn outcome(&self, status: RunStatus, results: ResultSet) -> RunOutcome {
        let state = self.state.lock().await;
        let diagnostics = std::mem::take(&mut *self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner));
        RunOutcome {
            run_id: self.run_id.clone(),
            status,
            results,
            pending: match status {
                RunStatus::Suspended => state.pending_ui.clone(),
                _ => None,
            },
            diagnostics,
            skipped: state.skipped_nodes.iter().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Computational worker
// ---------------------------------------------------------------------------

/// Everything a pooled computational invocation needs, owned.
struct ComputationalJob {
    events: NodeEvents,
    key: String,
    policy: Policy,
    capability: Arc<BoxComputationalCapability>,
    label: String,
    context: InvocationContext,
    inputs: Map<String, Value>,
    dry_run: bool,
}

impl ComputationalJob {
    async fn run(self) -> Result<NodeDone, RunnerError> {
        let started = Instant::now();
        self.events.emit(EventKind::NodeStart {
            node: self.key.clone(),
            capability: Some(self.label.clone()),
        })?;

        let capability = &self.capability;
        let context = &self.context;
        let inputs = &self.inputs;
        let enforced = if self.dry_run {
            enforce(&self.events, &self.key, &self.policy, || capability.dry_run(inputs)).await?
        } else {
            enforce(&self.events, &self.key, &self.policy, || capability.run(context, inputs)).await?
        };

        Ok(match enforced.value {
            Some(outputs) => NodeDone::new(outputs, enforced.attempts, started),
            None => NodeDone::degraded(enforced.attempts, started),
        })
    }
}
