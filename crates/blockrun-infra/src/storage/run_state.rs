//! JSON file implementation of `RunStateStore`.
//!
//! Every write replaces the whole document through a temp file and a rename,
//! so a crash never leaves a half-written state. Writers of the same run
//! serialize on a per-run async lock; distinct runs never contend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use blockrun_core::repository::run_state::{RunStateStore, StateStoreError, apply_submission};
use blockrun_types::run_state::RunState;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::run_file;

/// Run state persisted as `{state_dir}/{plan key}/{run_id}.json`.
#[derive(Debug)]
pub struct FileRunStateStore {
    state_dir: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FileRunStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of a run's state document.
    pub fn path(&self, plan_id: &str, run_id: &str) -> Result<PathBuf, StateStoreError> {
        Ok(run_file(&self.state_dir, plan_id, run_id, ".json")?)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read(path: &Path) -> Result<Option<RunState>, StateStoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateStoreError::Serialization(format!("{}: {e}", path.display())))
    }

    async fn write(path: &Path, state: &RunState) -> Result<(), StateStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl RunStateStore for FileRunStateStore {
    async fn load(&self, plan_id: &str, run_id: &str) -> Result<Option<RunState>, StateStoreError> {
        let path = self.path(plan_id, run_id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        Self::read(&path).await
    }

    async fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        let path = self.path(&state.plan_id, &state.run_id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        Self::write(&path, state).await?;
        tracing::trace!(plan = %state.plan_id, run_id = %state.run_id, status = ?state.status, "run state saved");
        Ok(())
    }

    async fn submit(
        &self,
        plan_id: &str,
        run_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<RunState, StateStoreError> {
        let path = self.path(plan_id, run_id)?;
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let mut state = Self::read(&path).await?.ok_or_else(|| StateStoreError::NotFound {
            plan_id: plan_id.to_string(),
            run_id: run_id.to_string(),
        })?;
        apply_submission(&mut state, outputs)?;
        Self::write(&path, &state).await?;
        tracing::info!(plan = plan_id, run_id, "interaction submitted");
        Ok(state)
    }
}
