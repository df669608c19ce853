//! Policy enforcement around a single node invocation.
//!
//! Applies the node's effective policy: a bounded wait per attempt, a
//! `node_error` event for every failure, re-invocation under `retry`, an
//! empty (degraded) output under `continue`, and propagation under `halt`
//! or once retries are exhausted.

use std::future::Future;
use std::time::Duration;

use blockrun_types::error::CapabilityError;
use blockrun_types::event::{EventKind, RunEvent};
use blockrun_types::plan::{OnError, Policy};
use serde_json::json;

use crate::event::{EventEmitter, EventLogError};

use super::RunnerError;

/// Emits events on behalf of one plan execution (root or child).
#[derive(Debug, Clone)]
pub(crate) struct NodeEvents {
    emitter: EventEmitter,
    plan: String,
    parent_run_id: Option<String>,
}

impl NodeEvents {
    pub(crate) fn new(emitter: EventEmitter, plan: String, parent_run_id: Option<String>) -> Self {
        Self {
            emitter,
            plan,
            parent_run_id,
        }
    }

    pub(crate) fn emit(&self, kind: EventKind) -> Result<RunEvent, EventLogError> {
        self.emitter
            .emit(&self.plan, self.parent_run_id.as_deref(), kind)
    }
}

/// Result of an enforced invocation. `value` is `None` when the failure was
/// absorbed under `on_error = continue`.
#[derive(Debug)]
pub(crate) struct Enforced<T> {
    pub value: Option<T>,
    pub attempts: u32,
}

enum Failure {
    Capability(CapabilityError),
    Timeout(u64),
}

impl Failure {
    fn describe(&self) -> CapabilityError {
        match self {
            Failure::Capability(e) => e.clone(),
            Failure::Timeout(ms) => {
                CapabilityError::new("timeout", format!("invocation exceeded {ms} ms"))
                    .with_details(json!({ "timeout_ms": ms }))
            }
        }
    }

    fn into_runner_error(self, node: &str) -> RunnerError {
        match self {
            Failure::Capability(source) => RunnerError::Capability {
                node: node.to_string(),
                source,
            },
            Failure::Timeout(timeout_ms) => RunnerError::Timeout {
                node: node.to_string(),
                timeout_ms,
            },
        }
    }
}

/// Invoke `call` under `policy`.
///
/// Non-recoverable errors are not retried. Attempts never exceed
/// `retries + 1`.
pub(crate) async fn enforce<T, F, Fut>(
    events: &NodeEvents,
    node_id: &str,
    policy: &Policy,
    mut call: F,
) -> Result<Enforced<T>, RunnerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match policy.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call()).await {
                Ok(result) => result.map_err(Failure::Capability),
                Err(_) => Err(Failure::Timeout(ms)),
            },
            None => call().await.map_err(Failure::Capability),
        };

        let failure = match outcome {
            Ok(value) => {
                return Ok(Enforced {
                    value: Some(value),
                    attempts: attempt,
                });
            }
            Err(failure) => failure,
        };

        let error = failure.describe();
        let will_retry = attempt < max_attempts && error.recoverable;
        events.emit(node_error(node_id, &error, attempt, will_retry))?;

        if will_retry {
            tracing::warn!(node = node_id, attempt, max_attempts, error = %error, "node failed, retrying");
            continue;
        }
        if policy.on_error == OnError::Continue {
            tracing::warn!(node = node_id, attempt, error = %error, "node failed, continuing with empty output");
            return Ok(Enforced {
                value: None,
                attempts: attempt,
            });
        }
        tracing::error!(node = node_id, attempt, error = %error, "node failed, halting run");
        return Err(failure.into_runner_error(node_id));
    }
}

/// Route a control-node failure (bad loop source, missing subflow plan)
/// through the node's policy. `Ok(())` means the failure was absorbed and
/// the node completes with an empty output.
pub(crate) fn absorb_failure(
    events: &NodeEvents,
    node_id: &str,
    policy: &Policy,
    error: CapabilityError,
    cause: RunnerError,
) -> Result<(), RunnerError> {
    events.emit(node_error(node_id, &error, 1, false))?;
    if policy.on_error == OnError::Continue {
        tracing::warn!(node = node_id, error = %error, "control node failed, continuing with empty output");
        return Ok(());
    }
    tracing::error!(node = node_id, error = %error, "control node failed, halting run");
    Err(cause)
}

fn node_error(node_id: &str, error: &CapabilityError, attempt: u32, will_retry: bool) -> EventKind {
    EventKind::NodeError {
        node: node_id.to_string(),
        error_code: error.code.clone(),
        recoverable: error.recoverable,
        message: error.message.clone(),
        details: error.details.clone(),
        attempt,
        will_retry,
    }
}
