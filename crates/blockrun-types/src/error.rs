use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error raised by a capability's `run` or `render`.
///
/// Carries a structured code, whether a retry could plausibly succeed, and
/// free-form diagnostic details. Emitted verbatim in `node_error` events.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CapabilityError {
    pub code: String,
    pub message: String,
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
    #[serde(default)]
    pub details: Value,
}

fn default_recoverable() -> bool {
    true
}

impl CapabilityError {
    /// A recoverable error with no details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable: true,
            details: Value::Null,
        }
    }

    /// An error that retrying will not fix.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            ..Self::new(code, message)
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}
