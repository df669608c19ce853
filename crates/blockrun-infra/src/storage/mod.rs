//! File-backed run storage.
//!
//! Layout under the configured state directory:
//!
//! ```text
//! {state_dir}/{plan key}/{run_id}.json          run state (atomic replace)
//! {state_dir}/{plan key}/{run_id}.events.jsonl  append-only event log
//! ```
//!
//! The plan key is the plan id with `/` replaced by `__`, so nested plan ids
//! stay one directory deep. Plan ids that already contain `__` are refused,
//! which keeps the mapping one-to-one (`a/b` and `a__b` never share files).

pub mod event_log;
pub mod run_state;

use std::io;
use std::path::{Path, PathBuf};

use tokio::runtime::{Handle, RuntimeFlavor};

pub use event_log::JsonlEventLog;
pub use run_state::FileRunStateStore;

/// Directory holding every file of `plan_id`'s runs.
pub(crate) fn plan_dir(state_dir: &Path, plan_id: &str) -> io::Result<PathBuf> {
    if plan_id.contains("__") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("plan id '{plan_id}' must not contain '__'"),
        ));
    }
    let key = plan_id.replace('/', "__");
    checked_component(&key)?;
    Ok(state_dir.join(key))
}

/// File for `run_id` with the given suffix.
pub(crate) fn run_file(state_dir: &Path, plan_id: &str, run_id: &str, suffix: &str) -> io::Result<PathBuf> {
    checked_component(run_id)?;
    Ok(plan_dir(state_dir, plan_id)?.join(format!("{run_id}{suffix}")))
}

/// Run synchronous file IO from code that may sit on a runtime worker.
///
/// On a multi-thread runtime the worker hands its other tasks off while `io`
/// blocks. Elsewhere (no runtime, or a current-thread one) `io` runs as is.
pub(crate) fn blocking_io<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(io),
        _ => io(),
    }
}

fn checked_component(name: &str) -> io::Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{name}' is not a valid file name component"),
        ));
    }
    Ok(())
}
