//! Shared domain types for blockrun.
//!
//! This crate contains the data model used across the plan runner: the Plan
//! and Node schema, execution policy, durable run state, the event record
//! format, and the capability error value.
//!
//! Zero infrastructure dependencies -- only serde, chrono, semver, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod run_state;
