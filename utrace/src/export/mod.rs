//! Chrome-trace export
//!
//! Converts the record stream into the Chrome trace-event JSON format so a
//! capture can be opened in `chrome://tracing` or Perfetto. Function calls
//! become complete ("X") events, context switches and callstacks become
//! instants. Addresses stay numeric; symbolication happens downstream.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::Serialize;

use crate::domain::{ExportError, Tid};
use crate::listener::TraceListener;
use crate::records::{
    Callstack, ContextSwitchIn, ContextSwitchOut, FunctionBegin, FunctionCall, FunctionEnd,
    TraceRecord,
};

#[derive(Debug, Serialize)]
struct ChromeEvent {
    name: String,
    ph: &'static str,
    /// Microseconds, per the trace-event format.
    ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: i32,
    tid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChromeTrace<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [ChromeEvent],
}

/// Accumulates records in memory and writes one JSON document at the end.
pub struct ChromeTraceExporter {
    target_pid: i32,
    events: Vec<ChromeEvent>,
}

#[allow(clippy::cast_precision_loss)]
fn to_us(timestamp_ns: u64) -> f64 {
    timestamp_ns as f64 / 1_000.0
}

impl ChromeTraceExporter {
    pub fn new(target_pid: i32) -> Self {
        Self {
            target_pid,
            events: Vec::new(),
        }
    }

    pub fn add_record(&mut self, record: &TraceRecord) {
        match record {
            TraceRecord::FunctionCall(call) => self.on_function_call(*call),
            TraceRecord::ContextSwitchIn(switch) => self.on_context_switch_in(*switch),
            TraceRecord::ContextSwitchOut(switch) => self.on_context_switch_out(*switch),
            TraceRecord::Callstack(callstack) => self.on_callstack(callstack.clone()),
            // Begin/end markers are redundant with the complete events, and
            // tid announcements carry no time.
            TraceRecord::FunctionBegin(_)
            | TraceRecord::FunctionEnd(_)
            | TraceRecord::TidSeen(_) => {}
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// # Errors
    /// Fails when the file cannot be created or serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path)
            .map_err(|e| ExportError::WriteFailed(format!("{}: {e}", path.display())))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(
            writer,
            &ChromeTrace {
                trace_events: &self.events,
            },
        )?;
        Ok(())
    }
}

impl TraceListener for ChromeTraceExporter {
    fn on_tid(&mut self, _tid: Tid) {}

    fn on_context_switch_in(&mut self, record: ContextSwitchIn) {
        self.events.push(ChromeEvent {
            name: "switch_in".to_string(),
            ph: "i",
            ts: to_us(record.timestamp_ns),
            dur: None,
            pid: self.target_pid,
            tid: record.tid.0,
            args: Some(serde_json::json!({ "cpu": record.cpu.0 })),
        });
    }

    fn on_context_switch_out(&mut self, record: ContextSwitchOut) {
        self.events.push(ChromeEvent {
            name: "switch_out".to_string(),
            ph: "i",
            ts: to_us(record.timestamp_ns),
            dur: None,
            pid: self.target_pid,
            tid: record.tid.0,
            args: Some(serde_json::json!({ "cpu": record.cpu.0 })),
        });
    }

    fn on_function_call(&mut self, record: FunctionCall) {
        self.events.push(ChromeEvent {
            name: format!("{:#x}", record.virtual_address),
            ph: "X",
            ts: to_us(record.begin_timestamp_ns),
            dur: Some(to_us(record.end_timestamp_ns - record.begin_timestamp_ns)),
            pid: self.target_pid,
            tid: record.tid.0,
            args: Some(serde_json::json!({ "depth": record.depth })),
        });
    }

    fn on_function_begin(&mut self, _record: FunctionBegin) {}

    fn on_function_end(&mut self, _record: FunctionEnd) {}

    fn on_callstack(&mut self, record: Callstack) {
        let frames: Vec<String> = record
            .frames
            .iter()
            .map(|f| format!("{:#x} {}", f.pc, f.map_name))
            .collect();
        self.events.push(ChromeEvent {
            name: "callstack".to_string(),
            ph: "i",
            ts: to_us(record.timestamp_ns),
            dur: None,
            pid: self.target_pid,
            tid: record.tid.0,
            args: Some(serde_json::json!({ "frames": frames })),
        });
    }
}
