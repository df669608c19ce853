//! Builtin capabilities registered by the CLI.
//!
//! - `std.echo`: returns its inputs as outputs (and does the same on a dry run).
//! - `std.form`: an interactive form. Renders its inputs as the form's
//!   defaults and reports `submitted` once a human has submitted data, which
//!   is merged over the defaults.

use blockrun_core::capability::registry::CapabilityRegistry;
use blockrun_core::capability::{ComputationalCapability, InteractiveCapability, InvocationContext, RenderOutput};
use blockrun_types::error::CapabilityError;
use semver::Version;
use serde_json::{Map, Value};

pub const ECHO_ID: &str = "std.echo";
pub const FORM_ID: &str = "std.form";

/// Register every builtin at version 1.0.0.
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    registry.register_computational(ECHO_ID, Version::new(1, 0, 0), EchoCapability);
    registry.register_interactive(FORM_ID, Version::new(1, 0, 0), FormCapability);
}

/// A registry holding only the builtins.
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry);
    registry
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCapability;

impl ComputationalCapability for EchoCapability {
    async fn run(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        tracing::debug!(plan = ctx.plan_id(), node = ctx.node_id(), keys = inputs.len(), "echo");
        Ok(inputs.clone())
    }

    async fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, CapabilityError> {
        Ok(inputs.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormCapability;

impl InteractiveCapability for FormCapability {
    async fn render(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<RenderOutput, CapabilityError> {
        let Some(submission) = &ctx.submission else {
            tracing::debug!(node = ctx.node_id(), "form rendered, awaiting submission");
            return Ok(RenderOutput::pending(inputs.clone()));
        };
        let mut outputs = inputs.clone();
        outputs.extend(submission.clone());
        Ok(RenderOutput::submitted(outputs))
    }
}
