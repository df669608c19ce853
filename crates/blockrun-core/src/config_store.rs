//! Configuration Store port for the `config.*` placeholder scope.

use serde_json::Value;

use crate::plan::placeholder::lookup_path;

/// Resolves a dotted namespace path (`sheets.token`) to a value.
///
/// Consulted only by the placeholder resolver and by plan validation.
pub trait ConfigStore: Send + Sync {
    fn get(&self, path: &str) -> Option<Value>;
}

/// In-memory store over a nested JSON object.
#[derive(Debug, Clone, Default)]
pub struct MapConfigStore {
    root: Value,
}

impl MapConfigStore {
    pub fn new(root: Value) -> Self {
        Self { root }
    }
}

impl ConfigStore for MapConfigStore {
    fn get(&self, path: &str) -> Option<Value> {
        lookup_path(&self.root, path.split('.')).cloned()
    }
}
