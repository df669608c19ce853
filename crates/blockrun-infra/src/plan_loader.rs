//! File-based plan lookup for subflow calls.
//!
//! A plan id maps to `<plans_dir>/<plan_id>.yaml`, then `.yml`, then
//! `.json`. Ids may contain `/` to address sub-directories.

use std::path::{Component, Path, PathBuf};

use blockrun_core::plan::definition::{PlanError, load_plan_file};
use blockrun_core::runner::plan_loader::PlanLoader;
use blockrun_types::plan::Plan;

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Loads plans from a directory tree.
#[derive(Debug, Clone)]
pub struct FilePlanLoader {
    plans_dir: PathBuf,
}

impl FilePlanLoader {
    pub fn new(plans_dir: impl Into<PathBuf>) -> Self {
        Self {
            plans_dir: plans_dir.into(),
        }
    }

    pub fn plans_dir(&self) -> &Path {
        &self.plans_dir
    }

    /// The first existing candidate file for `plan_id`.
    pub fn locate(&self, plan_id: &str) -> Result<Option<PathBuf>, PlanError> {
        let relative = Path::new(plan_id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if plan_id.is_empty() || escapes {
            return Err(PlanError::Validation(format!(
                "plan id '{plan_id}' must be a relative path without '..'"
            )));
        }

        Ok(EXTENSIONS
            .iter()
            .map(|ext| self.plans_dir.join(format!("{plan_id}.{ext}")))
            .find(|candidate| candidate.is_file()))
    }
}

impl PlanLoader for FilePlanLoader {
    fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError> {
        let Some(path) = self.locate(plan_id)? else {
            tracing::debug!(plan = plan_id, dir = %self.plans_dir.display(), "plan file not found");
            return Ok(None);
        };
        tracing::debug!(plan = plan_id, path = %path.display(), "loading plan file");
        load_plan_file(&path).map(Some)
    }
}
