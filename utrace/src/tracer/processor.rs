//! Ordered event processor
//!
//! Per-CPU rings deliver records out of global timestamp order. The
//! processor buffers events in a min-heap and only releases those older
//! than `now - processing_delay`, so the visitor observes a non-decreasing
//! timestamp sequence as long as arrivals stay within the window.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::os::unix::io::RawFd;

use log::error;

use super::clock::Clock;
use super::event::TracerEvent;

/// Consumer side of the processor. One exhaustive match over the event
/// variants replaces the double-dispatch visitor hierarchy.
pub trait EventVisitor {
    fn visit(&mut self, event: TracerEvent);
}

struct QueuedEvent {
    timestamp_ns: u64,
    /// Insertion sequence, so equal timestamps dispatch in arrival order.
    seq: u64,
    event: TracerEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp_ns == other.timestamp_ns && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the oldest on top.
        (other.timestamp_ns, other.seq).cmp(&(self.timestamp_ns, self.seq))
    }
}

pub struct PerfEventProcessor<V, C> {
    queue: BinaryHeap<QueuedEvent>,
    visitor: V,
    clock: C,
    processing_delay_ns: u64,
    last_processed_ns: u64,
    next_seq: u64,
}

impl<V: EventVisitor, C: Clock> PerfEventProcessor<V, C> {
    pub fn new(visitor: V, clock: C, processing_delay_ns: u64) -> Self {
        Self {
            queue: BinaryHeap::new(),
            visitor,
            clock,
            processing_delay_ns,
            last_processed_ns: 0,
            next_seq: 0,
        }
    }

    pub fn visitor_mut(&mut self) -> &mut V {
        &mut self.visitor
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    pub fn last_processed_ns(&self) -> u64 {
        self.last_processed_ns
    }

    /// Queue an event for ordered dispatch. An event older than the reorder
    /// window is a soft error: logged, but still queued, since the visitor
    /// may cope with slightly stale input.
    pub fn add_event(&mut self, origin_fd: RawFd, event: TracerEvent) {
        let timestamp_ns = event.timestamp_ns();
        if self.last_processed_ns > 0
            && timestamp_ns < self.last_processed_ns.saturating_sub(self.processing_delay_ns)
        {
            error!(
                "event from fd {origin_fd} is {} ns older than the reorder window",
                self.last_processed_ns - timestamp_ns
            );
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedEvent {
            timestamp_ns,
            seq,
            event,
        });
    }

    /// Dispatch every event that has aged past the reorder window.
    pub fn process_old_events(&mut self) {
        let now = self.clock.monotonic_ns();
        while let Some(head) = self.queue.peek() {
            // Recent events stay queued: a lagging ring may still deliver
            // something older.
            if head.timestamp_ns + self.processing_delay_ns > now {
                break;
            }
            self.pop_and_dispatch();
        }
    }

    /// Drain the queue regardless of age. Used at shutdown.
    pub fn process_all_events(&mut self) {
        while !self.queue.is_empty() {
            self.pop_and_dispatch();
        }
    }

    fn pop_and_dispatch(&mut self) {
        if let Some(queued) = self.queue.pop() {
            self.last_processed_ns = queued.timestamp_ns;
            self.visitor.visit(queued.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::super::event::{LostEvent, StackSampleEvent, TracerEvent};
    use super::*;
    use crate::domain::{CpuId, Tid};
    use crate::unwind::Registers;

    #[derive(Clone, Default)]
    struct ScriptedClock {
        now: Rc<Cell<u64>>,
    }

    impl Clock for ScriptedClock {
        fn monotonic_ns(&self) -> u64 {
            self.now.get()
        }
    }

    #[derive(Default)]
    struct RecordingVisitor {
        seen: Vec<u64>,
    }

    impl EventVisitor for RecordingVisitor {
        fn visit(&mut self, event: TracerEvent) {
            self.seen.push(event.timestamp_ns());
        }
    }

    fn sample_at(timestamp_ns: u64) -> TracerEvent {
        TracerEvent::StackSample(StackSampleEvent {
            tid: Tid(1),
            cpu: CpuId(0),
            timestamp_ns,
            regs: Registers::default(),
            stack: Vec::new(),
        })
    }

    fn processor(delay_ns: u64) -> (PerfEventProcessor<RecordingVisitor, ScriptedClock>, Rc<Cell<u64>>) {
        let clock = ScriptedClock::default();
        let now = Rc::clone(&clock.now);
        (
            PerfEventProcessor::new(RecordingVisitor::default(), clock, delay_ns),
            now,
        )
    }

    #[test]
    fn test_out_of_order_within_window_is_sorted() {
        let (mut processor, now) = processor(200_000_000);
        processor.add_event(3, sample_at(1_000_000_000));
        processor.add_event(4, sample_at(999_900_000));

        now.set(1_300_000_000);
        processor.process_old_events();

        assert_eq!(processor.visitor_mut().seen, vec![999_900_000, 1_000_000_000]);
        assert_eq!(processor.last_processed_ns(), 1_000_000_000);
    }

    #[test]
    fn test_recent_events_stay_queued() {
        let (mut processor, now) = processor(200_000_000);
        processor.add_event(3, sample_at(1_000_000_000));

        now.set(1_100_000_000);
        processor.process_old_events();
        assert!(processor.visitor_mut().seen.is_empty());
        assert_eq!(processor.queued_events(), 1);

        now.set(1_200_000_000);
        processor.process_old_events();
        assert_eq!(processor.visitor_mut().seen, vec![1_000_000_000]);
    }

    #[test]
    fn test_process_all_drains_regardless_of_age() {
        let (mut processor, _now) = processor(200_000_000);
        processor.add_event(3, sample_at(5));
        processor.add_event(3, sample_at(3));
        processor.process_all_events();
        assert_eq!(processor.visitor_mut().seen, vec![3, 5]);
    }

    #[test]
    fn test_stale_event_is_still_accepted() {
        let (mut processor, _now) = processor(100);
        processor.add_event(3, sample_at(10_000));
        processor.process_all_events();

        // Far older than last_processed - delay: soft error, still queued.
        processor.add_event(3, sample_at(5));
        assert_eq!(processor.queued_events(), 1);
        processor.process_all_events();
        assert_eq!(processor.visitor_mut().seen, vec![10_000, 5]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let (mut processor, _now) = processor(0);
        processor.add_event(1, TracerEvent::Lost(LostEvent { count: 1 }));
        processor.add_event(2, TracerEvent::Lost(LostEvent { count: 2 }));
        let mut order: Vec<u64> = Vec::new();
        processor.process_all_events();
        // Both have timestamp 0; the recording visitor saw both.
        order.extend(&processor.visitor_mut().seen);
        assert_eq!(order.len(), 2);
    }
}
