//! TOML-backed Configuration Store for the `config.*` placeholder scope.
//!
//! Nested tables are addressed by dotted path: `[mail.smtp] port = 25` is
//! `${config.mail.smtp.port}`.

use std::path::Path;

use blockrun_core::config_store::{ConfigStore, MapConfigStore};
use serde_json::{Map, Value};

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error in {path}: {message}")]
    Parse { path: String, message: String },
}

/// Read-only configuration loaded from a TOML file.
#[derive(Debug, Clone, Default)]
pub struct TomlConfigStore {
    inner: MapConfigStore,
}

impl TomlConfigStore {
    /// Parse TOML text.
    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigStoreError> {
        let table: toml::Table = toml::from_str(content).map_err(|e| ConfigStoreError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            inner: MapConfigStore::new(table_to_json(table)),
        })
    }

    /// Load `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self, ConfigStoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, &path.display().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config store file, config.* is empty");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, path: &str) -> Option<Value> {
        self.inner.get(path)
    }
}

fn table_to_json(table: toml::Table) -> Value {
    Value::Object(
        table
            .into_iter()
            .map(|(k, v)| (k, toml_to_json(v)))
            .collect::<Map<String, Value>>(),
    )
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => table_to_json(table),
    }
}
