//! Function-call matching
//!
//! Entry probes push onto a per-thread stack; return probes pop and emit a
//! completed call. Exits match entries LIFO on the same thread only; an
//! exit with no open entry is spurious (the entry predates tracing or was
//! lost) and produces nothing.

use std::collections::HashMap;

use crate::domain::Tid;
use crate::records::FunctionCall;

#[derive(Debug, Clone, Copy)]
struct OpenCall {
    virtual_address: u64,
    begin_timestamp_ns: u64,
}

#[derive(Debug, Default)]
pub struct FunctionCallManager {
    open_calls: HashMap<Tid, Vec<OpenCall>>,
}

impl FunctionCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entry(&mut self, tid: Tid, virtual_address: u64, timestamp_ns: u64) {
        self.open_calls.entry(tid).or_default().push(OpenCall {
            virtual_address,
            begin_timestamp_ns: timestamp_ns,
        });
    }

    /// Match a return probe against the innermost open entry. The thread's
    /// bookkeeping is removed once its stack empties.
    pub fn on_exit(&mut self, tid: Tid, timestamp_ns: u64) -> Option<FunctionCall> {
        let stack = self.open_calls.get_mut(&tid)?;
        let entry = stack.pop()?;
        #[allow(clippy::cast_possible_truncation)]
        let depth = stack.len() as u32;
        if stack.is_empty() {
            self.open_calls.remove(&tid);
        }
        Some(FunctionCall {
            tid,
            virtual_address: entry.virtual_address,
            begin_timestamp_ns: entry.begin_timestamp_ns,
            end_timestamp_ns: timestamp_ns,
            depth,
        })
    }

    /// Drop all open entries for a thread that exited.
    pub fn discard_thread(&mut self, tid: Tid) {
        self.open_calls.remove(&tid);
    }

    pub fn open_call_count(&self, tid: Tid) -> usize {
        self.open_calls.get(&tid).map_or(0, Vec::len)
    }
}
