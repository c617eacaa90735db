//! Tracer engine core
//!
//! Everything between the kernel's perf rings and the listener: ring-buffer
//! consumption, record parsing, ordered event processing, function-call
//! matching and callstack reconstruction.

pub mod callstacks;
pub mod clock;
pub mod config;
pub mod cpus;
pub mod engine;
pub mod event;
pub mod function_calls;
pub mod perf_sys;
pub mod processor;
pub mod record;
pub mod ring_buffer;
pub mod visitor;

pub use callstacks::CallstackManager;
pub use clock::{Clock, MonotonicClock};
pub use config::{InstrumentedFunction, TracerConfig};
pub use engine::TracerEngine;
pub use event::TracerEvent;
pub use function_calls::FunctionCallManager;
pub use processor::{EventVisitor, PerfEventProcessor};
pub use visitor::UnwindingVisitor;
