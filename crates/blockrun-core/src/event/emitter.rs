//! Sequenced event emission.
//!
//! One `EventEmitter` exists per root run id. Loop and subflow children
//! share it, so a root run and all its children produce a single, totally
//! ordered log. Sequence assignment and the sink append happen under the
//! same lock, which makes `seq` monotonic and gap-free in the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use blockrun_types::event::{EVENT_SCHEMA_VERSION, EventKind, RunEvent};
use chrono::Utc;

use super::bus::EventBus;

/// Errors raised by an event sink.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization error: {0}")]
    Serialization(String),
}

/// Append-only event storage keyed by (root plan id, run id).
///
/// Synchronous: appends happen while the emitter holds its sequencing lock.
pub trait EventSink: Send + Sync {
    fn append(&self, plan_id: &str, event: &RunEvent) -> Result<(), EventLogError>;

    /// Highest sequence number already stored for the run.
    fn last_seq(&self, plan_id: &str, run_id: &str) -> Result<Option<u64>, EventLogError>;

    /// All stored events of a run, in append order.
    fn read(&self, plan_id: &str, run_id: &str) -> Result<Vec<RunEvent>, EventLogError>;
}

// ---------------------------------------------------------------------------
// MemoryEventSink
// ---------------------------------------------------------------------------

/// In-memory sink used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    logs: Mutex<HashMap<(String, String), Vec<RunEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of one run, in append order.
    pub fn events(&self, plan_id: &str, run_id: &str) -> Vec<RunEvent> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(plan_id.to_string(), run_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&self, plan_id: &str, event: &RunEvent) -> Result<(), EventLogError> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((plan_id.to_string(), event.run_id.clone()))
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn last_seq(&self, plan_id: &str, run_id: &str) -> Result<Option<u64>, EventLogError> {
        Ok(self.events(plan_id, run_id).last().map(|e| e.seq))
    }

    fn read(&self, plan_id: &str, run_id: &str) -> Result<Vec<RunEvent>, EventLogError> {
        Ok(self.events(plan_id, run_id))
    }
}

// ---------------------------------------------------------------------------
// EventEmitter
// ---------------------------------------------------------------------------

struct EmitterInner {
    log_plan_id: String,
    run_id: String,
    sink: Arc<dyn EventSink>,
    bus: Option<EventBus>,
    next_seq: Mutex<u64>,
}

/// Assigns sequence numbers and writes events for one run id.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    /// Open the emitter for a run, continuing after any events already
    /// logged under the same run id (resume never reuses a `seq`).
    pub fn open(
        sink: Arc<dyn EventSink>,
        bus: Option<EventBus>,
        plan_id: &str,
        run_id: &str,
    ) -> Result<Self, EventLogError> {
        let next = sink.last_seq(plan_id, run_id)?.map_or(1, |s| s + 1);
        Ok(Self {
            inner: Arc::new(EmitterInner {
                log_plan_id: plan_id.to_string(),
                run_id: run_id.to_string(),
                sink,
                bus,
                next_seq: Mutex::new(next),
            }),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Emit one event on behalf of `plan` (the root plan or a child plan).
    pub fn emit(
        &self,
        plan: &str,
        parent_run_id: Option<&str>,
        kind: EventKind,
    ) -> Result<RunEvent, EventLogError> {
        let mut next = self
            .inner
            .next_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let event = RunEvent {
            seq: *next,
            ts: Utc::now(),
            plan: plan.to_string(),
            run_id: self.inner.run_id.clone(),
            parent_run_id: parent_run_id.map(str::to_string),
            schema: EVENT_SCHEMA_VERSION,
            kind,
        };
        self.inner.sink.append(&self.inner.log_plan_id, &event)?;
        *next += 1;
        if let Some(bus) = &self.inner.bus {
            bus.publish(event.clone());
        }
        Ok(event)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("plan_id", &self.inner.log_plan_id)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}
