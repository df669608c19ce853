//! Plan runner logic and port definitions for blockrun.
//!
//! This crate owns the scheduling semantics: placeholder resolution, guard
//! expressions, dependency graph, validation, capability registry, policy
//! enforcement, and the loop and subflow executors. Storage, configuration
//! and plan lookup are traits ("ports") implemented by `blockrun-infra`;
//! in-memory implementations live here for tests and dry runs. It depends
//! only on `blockrun-types`, never on `blockrun-infra` or any IO crate.

pub mod capability;
pub mod config_store;
pub mod event;
pub mod plan;
pub mod repository;
pub mod runner;
