//! Run State Store port.
//!
//! One `RunState` per (plan id, run id). Writes are last-write-wins under a
//! per-run lock; distinct runs never contend. `submit` is a read-modify-write
//! and must hold that lock for its whole duration.

use blockrun_types::run_state::RunState;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Errors raised by a run state store.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(String),

    #[error("no run state for plan '{plan_id}' run '{run_id}'")]
    NotFound { plan_id: String, run_id: String },

    #[error("run '{run_id}' has no pending interaction to submit")]
    NothingPending { run_id: String },
}

/// Durable run state storage.
///
/// Uses native async fn in traits (RPITIT), like the other storage ports.
pub trait RunStateStore: Send + Sync {
    /// Load the state of a run, if any was persisted.
    fn load(
        &self,
        plan_id: &str,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<RunState>, StateStoreError>> + Send;

    /// Replace the persisted state of `state.run_id`.
    fn save(
        &self,
        state: &RunState,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Mark the pending interaction submitted with `outputs`.
    ///
    /// The next run with the same run id hands `outputs` to the interactive
    /// capability as its submission.
    fn submit(
        &self,
        plan_id: &str,
        run_id: &str,
        outputs: Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<RunState, StateStoreError>> + Send;
}

/// Apply a submission to a loaded state. Shared by every store.
pub fn apply_submission(
    state: &mut RunState,
    outputs: Map<String, Value>,
) -> Result<(), StateStoreError> {
    let pending = state
        .pending_ui
        .as_mut()
        .ok_or_else(|| StateStoreError::NothingPending {
            run_id: state.run_id.clone(),
        })?;
    pending.submitted = true;
    pending.outputs = Some(outputs);
    state.updated_at = Utc::now();
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// `RunStateStore` held in a `DashMap`; the shard lock is the per-run lock.
#[derive(Debug, Default)]
pub struct InMemoryRunStateStore {
    states: DashMap<(String, String), RunState>,
}

impl InMemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted runs.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl RunStateStore for InMemoryRunStateStore {
    async fn load(&self, plan_id: &str, run_id: &str) -> Result<Option<RunState>, StateStoreError> {
        Ok(self
            .states
            .get(&(plan_id.to_string(), run_id.to_string()))
            .map(|s| s.clone()))
    }

    async fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        self.states
            .insert((state.plan_id.clone(), state.run_id.clone()), state.clone());
        Ok(())
    }

    async fn submit(
        &self,
        plan_id: &str,
        run_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<RunState, StateStoreError> {
        let mut entry = self
            .states
            .get_mut(&(plan_id.to_string(), run_id.to_string()))
            .ok_or_else(|| StateStoreError::NotFound {
                plan_id: plan_id.to_string(),
                run_id: run_id.to_string(),
            })?;
        apply_submission(&mut entry, outputs)?;
        Ok(entry.clone())
    }
}
