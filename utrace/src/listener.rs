//! Listener interface for normalized trace records
//!
//! The engine invokes the listener from its own thread; implementations must
//! not block or they stall the whole pipeline. `ChannelListener` is the
//! standard fan-out: it forwards records over a bounded channel with a
//! non-blocking send and drops on overflow.

use std::cell::RefCell;
use std::rc::Rc;

use crossbeam_channel::{Sender, TrySendError};
use log::warn;

use crate::domain::Tid;
use crate::records::{
    Callstack, ContextSwitchIn, ContextSwitchOut, FunctionBegin, FunctionCall, FunctionEnd,
    TraceRecord,
};

/// Sink for the normalized record stream. Every callback is total and must
/// not panic or block.
pub trait TraceListener {
    fn on_tid(&mut self, tid: Tid);
    fn on_context_switch_in(&mut self, record: ContextSwitchIn);
    fn on_context_switch_out(&mut self, record: ContextSwitchOut);
    fn on_function_call(&mut self, record: FunctionCall);
    fn on_function_begin(&mut self, record: FunctionBegin);
    fn on_function_end(&mut self, record: FunctionEnd);
    fn on_callstack(&mut self, record: Callstack);
}

/// Engine and visitor both emit records on the engine thread; a shared
/// `Rc<RefCell<_>>` lets them hold the same sink without aliasing issues.
impl<L: TraceListener> TraceListener for Rc<RefCell<L>> {
    fn on_tid(&mut self, tid: Tid) {
        self.borrow_mut().on_tid(tid);
    }

    fn on_context_switch_in(&mut self, record: ContextSwitchIn) {
        self.borrow_mut().on_context_switch_in(record);
    }

    fn on_context_switch_out(&mut self, record: ContextSwitchOut) {
        self.borrow_mut().on_context_switch_out(record);
    }

    fn on_function_call(&mut self, record: FunctionCall) {
        self.borrow_mut().on_function_call(record);
    }

    fn on_function_begin(&mut self, record: FunctionBegin) {
        self.borrow_mut().on_function_begin(record);
    }

    fn on_function_end(&mut self, record: FunctionEnd) {
        self.borrow_mut().on_function_end(record);
    }

    fn on_callstack(&mut self, record: Callstack) {
        self.borrow_mut().on_callstack(record);
    }
}

/// Forwards records over a bounded crossbeam channel.
///
/// Sends are non-blocking; when the consumer falls behind, records are
/// dropped and counted rather than stalling the engine.
pub struct ChannelListener {
    tx: Sender<TraceRecord>,
    dropped: u64,
}

impl ChannelListener {
    pub fn new(tx: Sender<TraceRecord>) -> Self {
        Self { tx, dropped: 0 }
    }

    /// Number of records dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn forward(&mut self, record: TraceRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    warn!("record channel full, dropping records");
                }
                self.dropped += 1;
            }
            Err(TrySendError::Disconnected(_)) => {
                // Consumer is gone; nothing left to do with records.
                self.dropped += 1;
            }
        }
    }
}

impl TraceListener for ChannelListener {
    fn on_tid(&mut self, tid: Tid) {
        self.forward(TraceRecord::TidSeen(tid));
    }

    fn on_context_switch_in(&mut self, record: ContextSwitchIn) {
        self.forward(TraceRecord::ContextSwitchIn(record));
    }

    fn on_context_switch_out(&mut self, record: ContextSwitchOut) {
        self.forward(TraceRecord::ContextSwitchOut(record));
    }

    fn on_function_call(&mut self, record: FunctionCall) {
        self.forward(TraceRecord::FunctionCall(record));
    }

    fn on_function_begin(&mut self, record: FunctionBegin) {
        self.forward(TraceRecord::FunctionBegin(record));
    }

    fn on_function_end(&mut self, record: FunctionEnd) {
        self.forward(TraceRecord::FunctionEnd(record));
    }

    fn on_callstack(&mut self, record: Callstack) {
        self.forward(TraceRecord::Callstack(record));
    }
}

/// Buffers every record in memory. Used by tests and by short capture runs.
#[derive(Default)]
pub struct CollectingListener {
    pub records: Vec<TraceRecord>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.records
            .iter()
            .filter_map(|r| match r {
                TraceRecord::FunctionCall(fc) => Some(*fc),
                _ => None,
            })
            .collect()
    }

    pub fn callstacks(&self) -> Vec<Callstack> {
        self.records
            .iter()
            .filter_map(|r| match r {
                TraceRecord::Callstack(cs) => Some(cs.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TraceListener for CollectingListener {
    fn on_tid(&mut self, tid: Tid) {
        self.records.push(TraceRecord::TidSeen(tid));
    }

    fn on_context_switch_in(&mut self, record: ContextSwitchIn) {
        self.records.push(TraceRecord::ContextSwitchIn(record));
    }

    fn on_context_switch_out(&mut self, record: ContextSwitchOut) {
        self.records.push(TraceRecord::ContextSwitchOut(record));
    }

    fn on_function_call(&mut self, record: FunctionCall) {
        self.records.push(TraceRecord::FunctionCall(record));
    }

    fn on_function_begin(&mut self, record: FunctionBegin) {
        self.records.push(TraceRecord::FunctionBegin(record));
    }

    fn on_function_end(&mut self, record: FunctionEnd) {
        self.records.push(TraceRecord::FunctionEnd(record));
    }

    fn on_callstack(&mut self, record: Callstack) {
        self.records.push(TraceRecord::Callstack(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CpuId;

    #[test]
    fn test_channel_listener_drops_on_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut listener = ChannelListener::new(tx);

        listener.on_tid(Tid(1));
        listener.on_tid(Tid(2));
        assert_eq!(listener.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), TraceRecord::TidSeen(Tid(1)));
    }

    #[test]
    fn test_channel_listener_survives_disconnect() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        drop(rx);
        let mut listener = ChannelListener::new(tx);
        listener.on_context_switch_in(ContextSwitchIn {
            tid: Tid(1),
            cpu: CpuId(0),
            timestamp_ns: 10,
        });
        assert_eq!(listener.dropped(), 1);
    }
}
