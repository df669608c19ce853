//! Infrastructure layer for blockrun.
//!
//! Contains implementations of the ports defined in `blockrun-core`: the
//! JSON run state file store, the JSONL event log, the TOML configuration
//! store, the file-based plan loader for subflows, the runner config loader,
//! and the builtin capabilities the CLI registers.

pub mod builtin;
pub mod config;
pub mod config_store;
pub mod plan_loader;
pub mod storage;
