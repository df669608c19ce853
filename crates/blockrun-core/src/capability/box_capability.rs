//! Object-safe wrappers for the capability traits.
//!
//! Same shape as the other boxed ports:
//! 1. an object-safe `*Dyn` trait with boxed futures
//! 2. a blanket impl for every implementor of the RPITIT trait
//! 3. a `Box*` newtype that delegates

use std::future::Future;
use std::pin::Pin;

use blockrun_types::error::CapabilityError;
use serde_json::{Map, Value};

use super::{ComputationalCapability, InteractiveCapability, InvocationContext, RenderOutput};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CapabilityError>> + Send + 'a>>;

/// Object-safe version of [`ComputationalCapability`].
pub trait ComputationalCapabilityDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Map<String, Value>>;

    fn dry_run_boxed<'a>(&'a self, inputs: &'a Map<String, Value>) -> BoxFuture<'a, Map<String, Value>>;
}

impl<T: ComputationalCapability> ComputationalCapabilityDyn for T {
    fn run_boxed<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Map<String, Value>> {
        Box::pin(self.run(ctx, inputs))
    }

    fn dry_run_boxed<'a>(&'a self, inputs: &'a Map<String, Value>) -> BoxFuture<'a, Map<String, Value>> {
        Box::pin(self.dry_run(inputs))
    }
}

/// Type-erased computational capability.
pub struct BoxComputationalCapability {
    inner: Box<dyn ComputationalCapabilityDyn>,
}

impl BoxComputationalCapability {
    pub fn new<T: ComputationalCapability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub async fn run(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        self.inner.run_boxed(ctx, inputs).await
    }

    pub async fn dry_run(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, CapabilityError> {
        self.inner.dry_run_boxed(inputs).await
    }
}

/// Object-safe version of [`InteractiveCapability`].
pub trait InteractiveCapabilityDyn: Send + Sync {
    fn render_boxed<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, RenderOutput>;
}

impl<T: InteractiveCapability> InteractiveCapabilityDyn for T {
    fn render_boxed<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, RenderOutput> {
        Box::pin(self.render(ctx, inputs))
    }
}

/// Type-erased interactive capability.
pub struct BoxInteractiveCapability {
    inner: Box<dyn InteractiveCapabilityDyn>,
}

impl BoxInteractiveCapability {
    pub fn new<T: InteractiveCapability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub async fn render(
        &self,
        ctx: &InvocationContext,
        inputs: &Map<String, Value>,
    ) -> Result<RenderOutput, CapabilityError> {
        self.inner.render_boxed(ctx, inputs).await
    }
}
