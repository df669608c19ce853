//! Runner configuration types.
//!
//! `RunnerConfig` represents `blockrun.toml` at the workspace root. Every
//! field has a default so an absent or partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::plan::DEFAULT_CONCURRENCY;

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Root for relative paths and the invocation context's workspace.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Directory searched for subflow plans (`<plans_dir>/<plan_id>.yaml`).
    #[serde(default = "default_plans_dir")]
    pub plans_dir: PathBuf,

    /// Directory holding run state files and event logs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// TOML file backing the `config.*` placeholder scope.
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,

    /// Worker pool width when a plan's policy does not override it.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Maximum nesting of subflow calls.
    #[serde(default = "default_max_subflow_depth")]
    pub max_subflow_depth: u32,

    /// Suspend on unsubmitted interactive nodes instead of accepting their
    /// rendered outputs as-is.
    #[serde(default = "default_interactive_wait")]
    pub interactive_wait: bool,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_plans_dir() -> PathBuf {
    PathBuf::from("plans")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".blockrun/runs")
}

fn default_config_file() -> PathBuf {
    PathBuf::from("config.toml")
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_subflow_depth() -> u32 {
    8
}

fn default_interactive_wait() -> bool {
    true
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            plans_dir: default_plans_dir(),
            state_dir: default_state_dir(),
            config_file: default_config_file(),
            default_concurrency: default_concurrency(),
            max_subflow_depth: default_max_subflow_depth(),
            interactive_wait: default_interactive_wait(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl RunnerConfig {
    /// Resolve a configured path against the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn plans_path(&self) -> PathBuf {
        self.resolve(&self.plans_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn config_path(&self) -> PathBuf {
        self.resolve(&self.config_file)
    }
}
