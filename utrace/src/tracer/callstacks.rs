//! Callstack reconstruction across uprobe trampolines
//!
//! The unwinder cannot resolve past the kernel's uprobe trampoline, so any
//! callstack taken while instrumented functions are on the stack ends in a
//! `[uprobes]` frame and only covers the path down to the innermost
//! instrumented function. Each entry probe therefore saves the outer part
//! of its own callstack as a *fragment*; later callstacks are completed by
//! splicing those fragments back on, most recent first.

use std::collections::HashMap;

use crate::domain::Tid;
use crate::unwind::Frame;

#[derive(Debug, Default)]
pub struct CallstackManager {
    /// Per-thread stack of fragments, one per open instrumented call.
    fragments: HashMap<Tid, Vec<Vec<Frame>>>,
}

impl CallstackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splice `callstack` with the thread's saved fragments.
    ///
    /// An empty `callstack` is an unwinding failure and stays empty. A
    /// callstack not ending in the trampoline is already complete. Any
    /// empty saved fragment poisons the join, because the true outer stack
    /// is unknown from that point down.
    fn join(callstack: &[Frame], previous: &[Vec<Frame>]) -> Vec<Frame> {
        let Some(last) = callstack.last() else {
            return Vec::new();
        };
        if !last.is_uprobes() {
            return callstack.to_vec();
        }
        if previous.iter().any(Vec::is_empty) {
            return Vec::new();
        }

        let mut full: Vec<Frame> = callstack[..callstack.len() - 1].to_vec();
        for fragment in previous.iter().rev() {
            full.extend(fragment.iter().cloned());
        }
        full
    }

    /// Complete a sampled callstack. Does not modify state.
    pub fn on_sample(&self, tid: Tid, callstack: &[Frame]) -> Vec<Frame> {
        let empty = Vec::new();
        let previous = self.fragments.get(&tid).unwrap_or(&empty);
        Self::join(callstack, previous)
    }

    /// Complete the callstack captured at an entry probe, then save its
    /// outer part as a fragment for deeper events.
    ///
    /// The saved fragment drops frame 0 (the instrumented function itself;
    /// deeper callstacks re-observe it) and a trailing trampoline frame. An
    /// unwinding failure saves an empty placeholder so deeper joins fail
    /// instead of fabricating frames.
    pub fn on_entry(&mut self, tid: Tid, callstack: &[Frame]) -> Vec<Frame> {
        let previous = self.fragments.entry(tid).or_default();
        let full = Self::join(callstack, previous);

        if callstack.is_empty() {
            previous.push(Vec::new());
        } else {
            let mut fragment: Vec<Frame> = callstack[1..].to_vec();
            if fragment.last().is_some_and(Frame::is_uprobes) {
                fragment.pop();
            }
            previous.push(fragment);
        }

        full
    }

    /// Pop the fragment of the returning call and complete a return-site
    /// callstack against the remaining ones. The thread's bookkeeping is
    /// removed once its fragment stack empties.
    pub fn on_exit(&mut self, tid: Tid, callstack: &[Frame]) -> Vec<Frame> {
        let Some(previous) = self.fragments.get_mut(&tid) else {
            return Self::join(callstack, &[]);
        };
        previous.pop();

        let full = Self::join(callstack, previous);

        if previous.is_empty() {
            self.fragments.remove(&tid);
        }
        full
    }

    /// Drop all fragments for a thread that exited.
    pub fn discard_thread(&mut self, tid: Tid) {
        self.fragments.remove(&tid);
    }

    pub fn fragment_count(&self, tid: Tid) -> usize {
        self.fragments.get(&tid).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pc: u64, map_name: &str) -> Frame {
        Frame {
            pc,
            function_name: None,
            function_offset: 0,
            map_name: map_name.to_string(),
        }
    }

    fn app_frame(pc: u64) -> Frame {
        frame(pc, "/usr/bin/target")
    }

    fn trampoline() -> Frame {
        frame(0x9999, "[uprobes]")
    }

    #[test]
    fn test_complete_callstack_passes_through() {
        let manager = CallstackManager::new();
        let callstack = vec![app_frame(1), app_frame(2)];
        assert_eq!(manager.on_sample(Tid(1), &callstack), callstack);
    }

    #[test]
    fn test_unwinding_failure_stays_empty() {
        let manager = CallstackManager::new();
        assert!(manager.on_sample(Tid(1), &[]).is_empty());
    }

    #[test]
    fn test_sample_splices_previous_fragment() {
        let mut manager = CallstackManager::new();
        // Entry probe into f1 called from f2: [f1, f2, trampoline-less root].
        manager.on_entry(Tid(1), &[app_frame(0xF1), app_frame(0xF2), app_frame(0xF3)]);

        // Sample inside the instrumented call ends in the trampoline.
        let sampled = vec![app_frame(0xAA), app_frame(0xBB), trampoline()];
        let full = manager.on_sample(Tid(1), &sampled);
        let pcs: Vec<u64> = full.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0xAA, 0xBB, 0xF2, 0xF3]);
        assert!(full.iter().all(|f| !f.is_uprobes()));
    }

    #[test]
    fn test_nested_fragments_splice_most_recent_first() {
        let mut manager = CallstackManager::new();
        manager.on_entry(Tid(1), &[app_frame(0xF1), app_frame(0x10)]);
        manager.on_entry(Tid(1), &[app_frame(0xF2), app_frame(0x20), trampoline()]);

        let full = manager.on_sample(Tid(1), &[app_frame(0xAA), trampoline()]);
        let pcs: Vec<u64> = full.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0xAA, 0x20, 0x10]);
    }

    #[test]
    fn test_empty_fragment_poisons_join() {
        let mut manager = CallstackManager::new();
        manager.on_entry(Tid(1), &[]); // unwinding failure placeholder
        let full = manager.on_sample(Tid(1), &[app_frame(0xAA), trampoline()]);
        assert!(full.is_empty());
    }

    #[test]
    fn test_entry_fragment_strips_leaf_and_trampoline() {
        let mut manager = CallstackManager::new();
        manager.on_entry(
            Tid(1),
            &[app_frame(0xF1), app_frame(0x11), app_frame(0x12), trampoline()],
        );
        assert_eq!(manager.fragment_count(Tid(1)), 1);

        let full = manager.on_sample(Tid(1), &[app_frame(0xAA), trampoline()]);
        let pcs: Vec<u64> = full.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0xAA, 0x11, 0x12]);
    }

    #[test]
    fn test_exit_pops_fragment_and_cleans_up() {
        let mut manager = CallstackManager::new();
        manager.on_entry(Tid(1), &[app_frame(0xF1), app_frame(0x10)]);
        manager.on_entry(Tid(1), &[app_frame(0xF2), app_frame(0x20), trampoline()]);
        assert_eq!(manager.fragment_count(Tid(1)), 2);

        manager.on_exit(Tid(1), &[]);
        assert_eq!(manager.fragment_count(Tid(1)), 1);
        manager.on_exit(Tid(1), &[]);
        assert_eq!(manager.fragment_count(Tid(1)), 0);
    }

    #[test]
    fn test_exit_joins_return_site_callstack() {
        let mut manager = CallstackManager::new();
        manager.on_entry(Tid(1), &[app_frame(0xF1), app_frame(0x10)]);
        manager.on_entry(Tid(1), &[app_frame(0xF2), app_frame(0x20), trampoline()]);

        // Returning from f2: its own fragment is popped first, the outer
        // one still applies.
        let full = manager.on_exit(Tid(1), &[app_frame(0xF2), app_frame(0x20), trampoline()]);
        let pcs: Vec<u64> = full.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0xF2, 0x20, 0x10]);
    }

    #[test]
    fn test_exit_without_state_is_harmless() {
        let mut manager = CallstackManager::new();
        let full = manager.on_exit(Tid(9), &[app_frame(0xAA)]);
        assert_eq!(full.len(), 1);
    }
}
