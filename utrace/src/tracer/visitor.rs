//! Per-event visitor
//!
//! Consumes ordered events from the processor, runs the unwinder, and feeds
//! the function-call and callstack managers. The visitor owns all per-thread
//! correlation state; nothing here is shared across threads.

use std::collections::HashMap;

use log::{debug, warn};

use super::callstacks::CallstackManager;
use super::event::{ProbeEvent, StackSampleEvent, TracerEvent};
use super::function_calls::FunctionCallManager;
use super::processor::EventVisitor;
use crate::domain::Tid;
use crate::listener::TraceListener;
use crate::records::{Callstack, CallstackFrame, FunctionBegin, FunctionEnd};
use crate::unwind::{Frame, Unwinder};

pub struct UnwindingVisitor<U, L> {
    unwinder: U,
    listener: L,
    function_calls: FunctionCallManager,
    callstacks: CallstackManager,
    /// Stack pointer recorded at each unmatched entry probe, per thread.
    /// Nested entries must have strictly decreasing stack pointers; anything
    /// else is a duplicate record or a lost return probe.
    entry_stack_pointers: HashMap<Tid, Vec<u64>>,
    emit_exit_callstacks: bool,
}

impl<U: Unwinder, L: TraceListener> UnwindingVisitor<U, L> {
    pub fn new(unwinder: U, listener: L, emit_exit_callstacks: bool) -> Self {
        Self {
            unwinder,
            listener,
            function_calls: FunctionCallManager::new(),
            callstacks: CallstackManager::new(),
            entry_stack_pointers: HashMap::new(),
            emit_exit_callstacks,
        }
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn emit_callstack(&mut self, tid: Tid, frames: Vec<Frame>, timestamp_ns: u64) {
        if frames.is_empty() {
            return;
        }
        let frames = frames
            .into_iter()
            .map(|f| CallstackFrame {
                pc: f.pc,
                function_name: f.function_name,
                function_offset: f.function_offset,
                map_name: f.map_name,
            })
            .collect();
        self.listener.on_callstack(Callstack {
            tid,
            frames,
            timestamp_ns,
        });
    }

    fn handle_sample(&mut self, event: &StackSampleEvent) {
        let frames = self.unwinder.unwind(&event.regs, &event.stack);
        let full = self.callstacks.on_sample(event.tid, &frames);
        self.emit_callstack(event.tid, full, event.timestamp_ns);
    }

    /// True when the entry must be dropped as a duplicate.
    fn check_duplicate_entry(&mut self, tid: Tid, sp: u64) -> bool {
        let stack_pointers = self.entry_stack_pointers.entry(tid).or_default();
        if let Some(&innermost) = stack_pointers.last() {
            if sp >= innermost {
                return true;
            }
        }
        stack_pointers.push(sp);
        false
    }

    fn handle_uprobe(&mut self, event: &ProbeEvent) {
        if self.check_duplicate_entry(event.tid, event.regs.sp) {
            warn!(
                "dropping duplicate uprobe on tid {} at {:#x} (sp not decreasing)",
                event.tid, event.function.virtual_address
            );
            return;
        }

        self.function_calls.on_entry(
            event.tid,
            event.function.virtual_address,
            event.timestamp_ns,
        );
        self.listener.on_function_begin(FunctionBegin {
            tid: event.tid,
            virtual_address: event.function.virtual_address,
            timestamp_ns: event.timestamp_ns,
        });

        let frames = self.unwinder.unwind(&event.regs, &event.stack);
        let full = self.callstacks.on_entry(event.tid, &frames);
        self.emit_callstack(event.tid, full, event.timestamp_ns);
    }

    fn handle_uretprobe(&mut self, event: &ProbeEvent) {
        if let Some(stack_pointers) = self.entry_stack_pointers.get_mut(&event.tid) {
            stack_pointers.pop();
            if stack_pointers.is_empty() {
                self.entry_stack_pointers.remove(&event.tid);
            }
        }

        if let Some(call) = self.function_calls.on_exit(event.tid, event.timestamp_ns) {
            self.listener.on_function_call(call);
            self.listener.on_function_end(FunctionEnd {
                tid: event.tid,
                virtual_address: event.function.virtual_address,
                timestamp_ns: event.timestamp_ns,
            });
        }

        // The fragment stack must shrink whether or not a return-site
        // callstack is wanted.
        if self.emit_exit_callstacks {
            let frames = self.unwinder.unwind(&event.regs, &event.stack);
            let full = self.callstacks.on_exit(event.tid, &frames);
            self.emit_callstack(event.tid, full, event.timestamp_ns);
        } else {
            self.callstacks.on_exit(event.tid, &[]);
        }
    }

    fn handle_thread_exit(&mut self, tid: Tid) {
        // Unmatched entries flush when their thread dies.
        self.function_calls.discard_thread(tid);
        self.callstacks.discard_thread(tid);
        self.entry_stack_pointers.remove(&tid);
    }
}

impl<U: Unwinder, L: TraceListener> EventVisitor for UnwindingVisitor<U, L> {
    fn visit(&mut self, event: TracerEvent) {
        match event {
            TracerEvent::Maps(e) => self.unwinder.set_maps(e.maps),
            TracerEvent::StackSample(e) => self.handle_sample(&e),
            TracerEvent::UprobeHit(e) => self.handle_uprobe(&e),
            TracerEvent::UretprobeHit(e) => self.handle_uretprobe(&e),
            TracerEvent::Exit(e) => self.handle_thread_exit(e.tid),
            TracerEvent::Fork(_) => {}
            // Context switches and lost counts are handled at the engine and
            // never queued; seeing one here is a dispatch bug worth noticing.
            TracerEvent::ContextSwitch(_)
            | TracerEvent::CpuWideContextSwitch(_)
            | TracerEvent::Lost(_) => {
                debug!("non-queueable event reached the visitor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::config::InstrumentedFunction;
    use super::super::event::TaskEvent;
    use super::*;
    use crate::domain::{CpuId, Pid};
    use crate::listener::CollectingListener;
    use crate::records::TraceRecord;
    use crate::unwind::{MemoryMaps, Registers};

    /// Unwinder returning a canned frame list regardless of input.
    #[derive(Default)]
    struct ScriptedUnwinder {
        frames: Vec<Frame>,
        maps_updates: usize,
    }

    impl Unwinder for ScriptedUnwinder {
        fn set_maps(&mut self, _maps: MemoryMaps) {
            self.maps_updates += 1;
        }

        fn unwind(&self, _regs: &Registers, _stack: &[u8]) -> Vec<Frame> {
            self.frames.clone()
        }
    }

    fn function(va: u64) -> Arc<InstrumentedFunction> {
        Arc::new(InstrumentedFunction {
            binary_path: "/usr/bin/target".into(),
            file_offset: 0x100,
            virtual_address: va,
        })
    }

    fn uprobe(tid: i32, va: u64, sp: u64, ts: u64) -> TracerEvent {
        TracerEvent::UprobeHit(ProbeEvent {
            tid: Tid(tid),
            timestamp_ns: ts,
            regs: Registers {
                ip: 0,
                sp,
                bp: 0,
            },
            stack: Vec::new(),
            function: function(va),
        })
    }

    fn uretprobe(tid: i32, va: u64, ts: u64) -> TracerEvent {
        TracerEvent::UretprobeHit(ProbeEvent {
            tid: Tid(tid),
            timestamp_ns: ts,
            regs: Registers::default(),
            stack: Vec::new(),
            function: function(va),
        })
    }

    fn visitor() -> UnwindingVisitor<ScriptedUnwinder, CollectingListener> {
        UnwindingVisitor::new(ScriptedUnwinder::default(), CollectingListener::new(), false)
    }

    #[test]
    fn test_nested_calls_produce_nested_intervals() {
        let mut visitor = visitor();
        visitor.visit(uprobe(1, 0xA, 0x200, 100));
        visitor.visit(uprobe(1, 0xB, 0x100, 200));
        visitor.visit(uretprobe(1, 0xB, 300));
        visitor.visit(uretprobe(1, 0xA, 400));

        let calls = visitor.listener_mut().function_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            (calls[0].virtual_address, calls[0].begin_timestamp_ns, calls[0].end_timestamp_ns, calls[0].depth),
            (0xB, 200, 300, 1)
        );
        assert_eq!(
            (calls[1].virtual_address, calls[1].begin_timestamp_ns, calls[1].end_timestamp_ns, calls[1].depth),
            (0xA, 100, 400, 0)
        );
    }

    #[test]
    fn test_duplicate_entry_is_dropped() {
        let mut visitor = visitor();
        visitor.visit(uprobe(1, 0xA, 0x200, 100));
        visitor.visit(uprobe(1, 0xA, 0x200, 101)); // same sp: duplicate
        visitor.visit(uretprobe(1, 0xA, 300));

        let calls = visitor.listener_mut().function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].begin_timestamp_ns, 100);
        assert_eq!(calls[0].end_timestamp_ns, 300);
        assert_eq!(calls[0].depth, 0);
    }

    #[test]
    fn test_growing_sp_is_dropped_too() {
        let mut visitor = visitor();
        visitor.visit(uprobe(1, 0xA, 0x100, 100));
        visitor.visit(uprobe(1, 0xB, 0x180, 200)); // sp grew: missed exit
        let begins: Vec<_> = visitor
            .listener_mut()
            .records
            .iter()
            .filter(|r| matches!(r, TraceRecord::FunctionBegin(_)))
            .collect();
        assert_eq!(begins.len(), 1);
    }

    #[test]
    fn test_unmatched_exit_is_silent() {
        let mut visitor = visitor();
        visitor.visit(uretprobe(1, 0xA, 100));
        assert!(visitor.listener_mut().function_calls().is_empty());
    }

    #[test]
    fn test_sample_emits_callstack() {
        let mut visitor = visitor();
        visitor.unwinder.frames = vec![Frame {
            pc: 0x1234,
            function_name: None,
            function_offset: 0x34,
            map_name: "/usr/bin/target".into(),
        }];
        visitor.visit(TracerEvent::StackSample(StackSampleEvent {
            tid: Tid(1),
            cpu: CpuId(0),
            timestamp_ns: 500,
            regs: Registers::default(),
            stack: Vec::new(),
        }));

        let callstacks = visitor.listener_mut().callstacks();
        assert_eq!(callstacks.len(), 1);
        assert_eq!(callstacks[0].timestamp_ns, 500);
        assert_eq!(callstacks[0].frames[0].pc, 0x1234);
    }

    #[test]
    fn test_failed_unwind_emits_nothing() {
        let mut visitor = visitor();
        visitor.visit(TracerEvent::StackSample(StackSampleEvent {
            tid: Tid(1),
            cpu: CpuId(0),
            timestamp_ns: 500,
            regs: Registers::default(),
            stack: Vec::new(),
        }));
        assert!(visitor.listener_mut().callstacks().is_empty());
    }

    #[test]
    fn test_maps_event_updates_unwinder() {
        let mut visitor = visitor();
        visitor.visit(TracerEvent::Maps(super::super::event::MapsEvent {
            timestamp_ns: 1,
            maps: MemoryMaps::default(),
        }));
        assert_eq!(visitor.unwinder.maps_updates, 1);
    }

    #[test]
    fn test_thread_exit_flushes_state() {
        let mut visitor = visitor();
        visitor.visit(uprobe(1, 0xA, 0x200, 100));
        visitor.visit(TracerEvent::Exit(TaskEvent {
            pid: Pid(1),
            tid: Tid(1),
            timestamp_ns: 150,
        }));
        visitor.visit(uretprobe(1, 0xA, 300));
        assert!(visitor.listener_mut().function_calls().is_empty());
    }

    #[test]
    fn test_exit_callstack_is_config_gated() {
        let mut visitor = UnwindingVisitor::new(
            ScriptedUnwinder::default(),
            CollectingListener::new(),
            true,
        );
        visitor.unwinder.frames = vec![Frame {
            pc: 0xAB,
            function_name: None,
            function_offset: 0,
            map_name: "/usr/bin/target".into(),
        }];
        visitor.visit(uprobe(1, 0xA, 0x200, 100));
        visitor.visit(uretprobe(1, 0xA, 200));

        // Entry and exit both emitted a callstack.
        assert_eq!(visitor.listener_mut().callstacks().len(), 2);
    }
}
