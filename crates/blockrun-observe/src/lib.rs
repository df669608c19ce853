//! Observability setup for blockrun binaries.

pub mod tracing_setup;
