//! Loop executor: `foreach` fan-out and sequential `while`.
//!
//! Each iteration is a child frame over the loop body with scope
//! `<loop key>[<index>]`. Children see the enclosing frame's settled outputs
//! through a snapshot, never each other's. Both loop forms publish one local
//! key, `collect`, holding the children's result sets.

use std::sync::Arc;
use std::time::Instant;

use blockrun_types::error::CapabilityError;
use blockrun_types::event::EventKind;
use blockrun_types::plan::{Node, Plan, Policy, ResultSet};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::plan::definition::PlanError;
use crate::plan::expression::evaluate_guard;
use crate::plan::placeholder::{OutputTable, Resolver};
use crate::repository::run_state::RunStateStore;

use super::RunnerError;
use super::policy::{NodeEvents, absorb_failure};
use super::scheduler::{Frame, FrameOutcome, Inline, NodeDone, Ready, RunContext};

/// Local output key of every loop node.
pub(super) const COLLECT: &str = "collect";

impl<S: RunStateStore + 'static> RunContext<S> {
    pub(super) async fn run_loop(
        self: &Arc<Self>,
        frame: &Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        policy: &Policy,
        ready: Ready,
    ) -> Result<Inline, RunnerError> {
        let Some(body) = node.body.as_deref() else {
            return Err(PlanError::Validation(format!("loop node '{}' has no body", node.id)).into());
        };
        let body = Arc::new(body.clone());

        events.emit(EventKind::NodeStart {
            node: key.to_string(),
            capability: None,
        })?;

        match (&node.foreach, ready.foreach_source) {
            (Some(spec), Some(source)) => {
                let width = spec
                    .max_concurrency
                    .or(policy.concurrency)
                    .unwrap_or(self.options.default_concurrency)
                    .max(1);
                self.run_foreach(frame, events, key, policy, body, &spec.item, source, width)
                    .await
            }
            _ => self.run_while(frame, events, node, key, policy, body).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_foreach(
        self: &Arc<Self>,
        frame: &Frame,
        events: &NodeEvents,
        key: &str,
        policy: &Policy,
        body: Arc<Plan>,
        item: &str,
        source: Value,
        width: usize,
    ) -> Result<Inline, RunnerError> {
        let started = Instant::now();
        let items = match source {
            Value::Array(items) => items,
            other => {
                let error = CapabilityError::fatal(
                    "invalid_foreach_source",
                    format!("foreach source must be an array, got {}", json_type(&other)),
                );
                let cause = RunnerError::Capability {
                    node: key.to_string(),
                    source: error.clone(),
                };
                absorb_failure(events, key, policy, error, cause)?;
                return Ok(Inline::Done(NodeDone::degraded(1, started)));
            }
        };

        tracing::debug!(node = %key, children = items.len(), width, "starting foreach");
        let snapshot = Arc::new(frame.outputs.clone());
        let pool = Arc::new(Semaphore::new(width));
        let mut children: JoinSet<Result<(usize, FrameOutcome), RunnerError>> = JoinSet::new();

        for (index, element) in items.into_iter().enumerate() {
            events.emit(EventKind::LoopIteration {
                node: key.to_string(),
                index,
            })?;

            let mut vars = child_vars(&body, frame);
            vars.insert(item.to_string(), element);
            vars.insert("__index".to_string(), json!(index));
            let child = Frame::child(
                body.clone(),
                format!("{key}[{index}]"),
                self.run_id.clone(),
                vars,
                OutputTable::child_of(snapshot.clone()),
                frame.depth,
            );

            let ctx = Arc::clone(self);
            let pool = pool.clone();
            children.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|e| RunnerError::Join(e.to_string()))?;
                let outcome = ctx.execute_boxed(child).await?;
                Ok((index, outcome))
            });
        }

        let mut collected: Vec<(usize, ResultSet)> = Vec::new();
        let mut suspended = false;
        while let Some(joined) = children.join_next().await {
            let result = joined.map_err(|e| RunnerError::Join(e.to_string()))?;
            match result {
                Ok((index, FrameOutcome::Completed(results))) => collected.push((index, results)),
                Ok((_, FrameOutcome::Suspended(_))) => suspended = true,
                Err(err) => {
                    children.abort_all();
                    return Err(err);
                }
            }
        }
        if suspended {
            return Ok(Inline::Suspended);
        }

        // Children finish in any order; `collect` follows the source order.
        collected.sort_by_key(|(index, _)| *index);
        let collect: Vec<Value> = collected.into_iter().map(|(_, r)| Value::Object(r)).collect();
        Ok(Inline::Done(NodeDone::new(collect_output(collect), 1, started)))
    }

    async fn run_while(
        self: &Arc<Self>,
        frame: &Frame,
        events: &NodeEvents,
        node: &Node,
        key: &str,
        policy: &Policy,
        body: Arc<Plan>,
    ) -> Result<Inline, RunnerError> {
        let started = Instant::now();
        let Some(spec) = &node.while_loop else {
            return Err(PlanError::Validation(format!(
                "loop node '{}' needs 'foreach' or 'while'",
                node.id
            ))
            .into());
        };

        let snapshot = Arc::new(frame.outputs.clone());
        let mut collect = Vec::new();
        for iteration in 0..spec.max_iterations {
            let resolver = Resolver::new(&frame.vars, &frame.outputs, self.config_store.as_ref());
            let proceed = match evaluate_guard(&spec.condition, &resolver, "0") {
                Ok(proceed) => proceed,
                Err(e) => {
                    let error = CapabilityError::fatal("expression_error", e.to_string())
                        .with_details(json!({ "expr": spec.condition }));
                    let cause = RunnerError::Capability {
                        node: key.to_string(),
                        source: error.clone(),
                    };
                    absorb_failure(events, key, policy, error, cause)?;
                    return Ok(Inline::Done(NodeDone::degraded(1, started)));
                }
            };
            if !proceed {
                tracing::debug!(node = %key, iteration, "while condition false, stopping");
                break;
            }

            events.emit(EventKind::LoopIteration {
                node: key.to_string(),
                index: iteration as usize,
            })?;
            let mut vars = child_vars(&body, frame);
            vars.insert("__iteration".to_string(), json!(iteration));
            let child = Frame::child(
                body.clone(),
                format!("{key}[{iteration}]"),
                self.run_id.clone(),
                vars,
                OutputTable::child_of(snapshot.clone()),
                frame.depth,
            );

            match Arc::clone(self).execute_boxed(child).await? {
                FrameOutcome::Completed(results) => collect.push(Value::Object(results)),
                FrameOutcome::Suspended(_) => return Ok(Inline::Suspended),
            }
        }

        Ok(Inline::Done(NodeDone::new(collect_output(collect), 1, started)))
    }
}

/// Body defaults overlaid by the enclosing frame's variables.
fn child_vars(body: &Plan, frame: &Frame) -> Map<String, Value> {
    let mut vars = body.vars.clone();
    vars.extend(frame.vars.clone());
    vars
}

fn collect_output(collect: Vec<Value>) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert(COLLECT.to_string(), Value::Array(collect));
    outputs
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
