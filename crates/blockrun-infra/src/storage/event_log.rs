//! Append-only JSONL event log.
//!
//! One line per `RunEvent`. Appends to the same run file serialize on a
//! per-file lock; the emitter already holds its sequencing lock around each
//! append, so lines land in `seq` order. File access goes through
//! [`blocking_io`] so a multi-thread runtime keeps scheduling other tasks.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use blockrun_core::event::{EventLogError, EventSink};
use blockrun_types::event::RunEvent;
use dashmap::DashMap;

use super::{blocking_io, run_file};

/// Event log persisted as `{state_dir}/{plan key}/{run_id}.events.jsonl`.
#[derive(Debug)]
pub struct JsonlEventLog {
    state_dir: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl JsonlEventLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            locks: DashMap::new(),
        }
    }

    /// Path of a run's log file.
    pub fn path(&self, plan_id: &str, run_id: &str) -> Result<PathBuf, EventLogError> {
        Ok(run_file(&self.state_dir, plan_id, run_id, ".events.jsonl")?)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_path(path: &Path) -> Result<Vec<RunEvent>, EventLogError> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed event line"),
            }
        }
        Ok(events)
    }
}

impl EventSink for JsonlEventLog {
    fn append(&self, plan_id: &str, event: &RunEvent) -> Result<(), EventLogError> {
        let path = self.path(plan_id, &event.run_id)?;
        let mut line = serde_json::to_string(event).map_err(|e| EventLogError::Serialization(e.to_string()))?;
        line.push('\n');

        let lock = self.lock_for(&path);
        blocking_io(|| {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            Ok(())
        })
    }

    fn last_seq(&self, plan_id: &str, run_id: &str) -> Result<Option<u64>, EventLogError> {
        Ok(self.read(plan_id, run_id)?.iter().map(|e| e.seq).max())
    }

    fn read(&self, plan_id: &str, run_id: &str) -> Result<Vec<RunEvent>, EventLogError> {
        let path = self.path(plan_id, run_id)?;
        let lock = self.lock_for(&path);
        blocking_io(|| {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            Self::read_path(&path)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockrun_core::event::EventEmitter;
    use blockrun_types::event::EventKind;
    use tempfile::TempDir;

    #[test]
    fn appended_events_read_back_in_order() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(JsonlEventLog::new(tmp.path()));
        let emitter = EventEmitter::open(log.clone(), None, "intake", "r1").unwrap();
        emitter.emit("intake", None, EventKind::Start { resumed: false }).unwrap();
        emitter
            .emit(
                "intake",
                None,
                EventKind::NodeStart {
                    node: "load".into(),
                    capability: Some("std.echo@1.0.0".into()),
                },
            )
            .unwrap();

        let events = log.read("intake", "r1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[1].node(), Some("load"));
        assert_eq!(log.last_seq("intake", "r1").unwrap(), Some(2));

        let raw = std::fs::read_to_string(tmp.path().join("intake/r1.events.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().all(|l| l.contains("\"schema\":1")));
    }

    #[test]
    fn reopened_emitter_continues_sequence() {
        let tmp = TempDir::new().unwrap();
        let log: Arc<dyn EventSink> = Arc::new(JsonlEventLog::new(tmp.path()));
        let first = EventEmitter::open(log.clone(), None, "intake", "r1").unwrap();
        first.emit("intake", None, EventKind::Start { resumed: false }).unwrap();
        first.emit("intake", None, EventKind::Suspend { node: "form".into() }).unwrap();

        let second = EventEmitter::open(log.clone(), None, "intake", "r1").unwrap();
        let event = second.emit("intake", None, EventKind::Start { resumed: true }).unwrap();
        assert_eq!(event.seq, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_emits_from_worker_tasks_stay_ordered() {
        let tmp = TempDir::new().unwrap();
        let log = Arc::new(JsonlEventLog::new(tmp.path()));
        let emitter = EventEmitter::open(log.clone(), None, "fanout", "r1").unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..8 {
            let emitter = emitter.clone();
            tasks.spawn(async move {
                for index in 0..25 {
                    emitter
                        .emit(
                            "fanout",
                            None,
                            EventKind::LoopIteration {
                                node: format!("w{worker}"),
                                index,
                            },
                        )
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let events = log.read("fanout", "r1").unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn missing_log_is_empty_and_bad_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = JsonlEventLog::new(tmp.path());
        assert!(log.read("intake", "none").unwrap().is_empty());
        assert_eq!(log.last_seq("intake", "none").unwrap(), None);

        std::fs::create_dir_all(tmp.path().join("intake")).unwrap();
        std::fs::write(tmp.path().join("intake/r2.events.jsonl"), "garbage\n\n").unwrap();
        assert!(log.read("intake", "r2").unwrap().is_empty());
    }
}
