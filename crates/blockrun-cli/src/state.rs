//! Application state wiring the file-backed runner together.
//!
//! `AppState` pins `PlanRunner`'s store generic to the infra implementations
//! and resolves every path from the workspace's `blockrun.toml`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use blockrun_core::event::EventBus;
use blockrun_core::plan::definition::load_plan_file;
use blockrun_core::runner::plan_loader::PlanLoader;
use blockrun_core::runner::{PlanRunner, RunnerOptions};
use blockrun_infra::builtin::builtin_registry;
use blockrun_infra::config::load_runner_config;
use blockrun_infra::config_store::TomlConfigStore;
use blockrun_infra::plan_loader::FilePlanLoader;
use blockrun_infra::storage::{FileRunStateStore, JsonlEventLog};
use blockrun_types::config::RunnerConfig;
use blockrun_types::plan::Plan;

pub type ConcreteRunner = PlanRunner<FileRunStateStore>;

/// Shared state for every command.
pub struct AppState {
    pub config: RunnerConfig,
    pub runner: ConcreteRunner,
    pub bus: EventBus,
    pub loader: Arc<FilePlanLoader>,
    pub event_log: Arc<JsonlEventLog>,
}

impl AppState {
    /// Load `blockrun.toml` from `workspace` and wire the runner.
    pub async fn init(workspace: &Path) -> Result<Self> {
        let config = load_runner_config(workspace).await;

        let config_path = config.config_path();
        let config_store = TomlConfigStore::load(&config_path)
            .with_context(|| format!("Failed to load config store {}", config_path.display()))?;

        let state_dir = config.state_path();
        let loader = Arc::new(FilePlanLoader::new(config.plans_path()));
        let event_log = Arc::new(JsonlEventLog::new(&state_dir));
        let bus = EventBus::new(config.event_bus_capacity);

        let runner = PlanRunner::new(
            Arc::new(builtin_registry()),
            Arc::new(FileRunStateStore::new(&state_dir)),
            event_log.clone(),
        )
        .with_config_store(Arc::new(config_store))
        .with_plan_loader(loader.clone())
        .with_event_bus(bus.clone())
        .with_options(RunnerOptions::from(&config));

        tracing::debug!(
            workspace = %config.workspace_root.display(),
            state_dir = %state_dir.display(),
            "workspace initialized"
        );

        Ok(Self {
            config,
            runner,
            bus,
            loader,
            event_log,
        })
    }

    /// Load a plan from a file path, or by id from the plans directory.
    pub fn load_plan(&self, target: &str) -> Result<Plan> {
        let path = Path::new(target);
        if path.is_file() {
            return load_plan_file(path).with_context(|| format!("Failed to load plan file {target}"));
        }
        self.loader
            .load(target)
            .with_context(|| format!("Failed to load plan '{target}'"))?
            .ok_or_else(|| {
                anyhow!(
                    "No plan file or plan id '{target}' found (searched {})",
                    self.loader.plans_dir().display()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn plans_load_by_path_or_id() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("plans")).unwrap();
        std::fs::write(tmp.path().join("plans/intake.yaml"), "id: intake\nnodes: []\n").unwrap();
        std::fs::write(tmp.path().join("adhoc.json"), r#"{"id": "adhoc"}"#).unwrap();

        let state = AppState::init(tmp.path()).await.unwrap();
        assert_eq!(state.load_plan("intake").unwrap().id, "intake");
        let by_path = tmp.path().join("adhoc.json");
        assert_eq!(state.load_plan(by_path.to_str().unwrap()).unwrap().id, "adhoc");
        assert!(state.load_plan("missing").is_err());
    }

    #[tokio::test]
    async fn malformed_config_store_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "not = [valid").unwrap();
        assert!(AppState::init(tmp.path()).await.is_err());
    }
}
