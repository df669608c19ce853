//! Runner configuration loader for blockrun.
//!
//! Reads `blockrun.toml` from the workspace directory and deserializes it
//! into [`RunnerConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use blockrun_types::config::RunnerConfig;

/// File name of the runner configuration inside a workspace.
pub const CONFIG_FILE_NAME: &str = "blockrun.toml";

/// Load runner configuration from `{workspace}/blockrun.toml`.
///
/// - Missing file: defaults, rooted at `workspace`.
/// - Unreadable or unparseable file: a warning and the defaults.
/// - A relative `workspace_root` in the file is resolved against `workspace`.
pub async fn load_runner_config(workspace: &Path) -> RunnerConfig {
    let config_path = workspace.join(CONFIG_FILE_NAME);

    let mut config = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => match toml::from_str::<RunnerConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
                RunnerConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            RunnerConfig::default()
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            RunnerConfig::default()
        }
    };

    if config.workspace_root.is_relative() {
        config.workspace_root = workspace.join(&config.workspace_root);
    }
    config
}
