//! Storage ports implemented by the infrastructure layer.
//!
//! The core crate never depends on a specific storage technology; the
//! in-memory implementations here back tests and dry runs.

pub mod run_state;
