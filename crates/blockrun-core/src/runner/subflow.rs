//! Subflow executor: run an external plan as a nested frame.

use std::sync::Arc;
use std::time::Instant;

use blockrun_types::error::CapabilityError;
use blockrun_types::event::EventKind;
use blockrun_types::plan::{Node, Policy};
use serde_json::json;

use crate::plan::definition::{PlanError, validate_plan};
use crate::plan::placeholder::OutputTable;
use crate::repository::run_state::RunStateStore;

use super::RunnerError;
use super::policy::{NodeEvents, absorb_failure};
use super::scheduler::{Frame, FrameOutcome, Inline, NodeDone, Ready, RunContext};

impl<S: RunStateStore + 'static> RunContext<S> {
    /// Load `call.plan`, validate it, and run it with the caller's resolved
    /// `call.inputs` overriding its variables. The child's result set becomes
    /// this node's local output, published through the node's alias map.
    /// A target that fails to load or validate follows the node's error policy.
    pub(super) async fn run_subflow(
        self: &Arc<Self>,
        frame: &Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        policy: &Policy,
        ready: Ready,
    ) -> Result<Inline, RunnerError> {
        let started = Instant::now();
        let Some(call) = &node.call else {
            return Err(PlanError::Validation(format!("subflow node '{}' has no 'call'", node.id)).into());
        };

        events.emit(EventKind::NodeStart {
            node: key.to_string(),
            capability: Some(call.plan.clone()),
        })?;

        let depth = frame.depth + 1;
        let max = self.options.max_subflow_depth;
        if depth > max {
            let error = CapabilityError::fatal(
                "subflow_depth_exceeded",
                format!("subflow depth {depth} exceeds maximum {max}"),
            )
            .with_details(json!({ "depth": depth, "max": max }));
            let cause = RunnerError::SubflowDepthExceeded {
                node: key.to_string(),
                depth,
                max,
            };
            absorb_failure(events, key, policy, error, cause)?;
            return Ok(Inline::Done(NodeDone::degraded(1, started)));
        }

        let loaded = self
            .plan_loader
            .load(&call.plan)
            .and_then(|plan| match plan {
                Some(plan) => validate_plan(&plan, &self.registry, self.config_store.as_ref()).map(|()| Some(plan)),
                None => Ok(None),
            });
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(source) => {
                let error = CapabilityError::fatal("invalid_subflow_plan", source.to_string())
                    .with_details(json!({ "plan": call.plan }));
                let cause = RunnerError::InvalidSubflow {
                    node: key.to_string(),
                    plan: call.plan.clone(),
                    source,
                };
                absorb_failure(events, key, policy, error, cause)?;
                return Ok(Inline::Done(NodeDone::degraded(1, started)));
            }
        };
        let Some(child_plan) = loaded else {
            let error = CapabilityError::fatal("plan_not_found", format!("plan '{}' not found", call.plan))
                .with_details(json!({ "plan": call.plan }));
            let cause = RunnerError::PlanNotFound {
                node: key.to_string(),
                plan: call.plan.clone(),
            };
            absorb_failure(events, key, policy, error, cause)?;
            return Ok(Inline::Done(NodeDone::degraded(1, started)));
        };

        tracing::debug!(node = %key, plan = %child_plan.id, depth, "entering subflow");
        let mut vars = child_plan.vars.clone();
        vars.extend(ready.call_inputs);
        let child = Frame::child(
            Arc::new(child_plan),
            key.to_string(),
            self.run_id.clone(),
            vars,
            OutputTable::new(),
            depth,
        );

        match Arc::clone(self).execute_boxed(child).await? {
            FrameOutcome::Completed(results) => Ok(Inline::Done(NodeDone::new(results, 1, started))),
            FrameOutcome::Suspended(_) => Ok(Inline::Suspended),
        }
    }
}
