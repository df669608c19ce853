//! Run event stream: sequencing emitter, durable sinks, broadcast bus.
//!
//! The emitter assigns `seq` and appends to the sink under one lock per run,
//! then publishes the same record on the `EventBus` for live subscribers.

pub mod bus;
pub mod emitter;

pub use bus::EventBus;
pub use emitter::{EventEmitter, EventLogError, EventSink, MemoryEventSink};
