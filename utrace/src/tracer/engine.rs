//! Tracer engine
//!
//! Owns every counter fd and ring buffer, polls them round-robin, parses
//! records into typed events, and routes them: context switches straight to
//! the listener (latency-sensitive, already ordered per CPU), everything
//! else through the ordered processor. FORK/EXIT records drive the
//! per-thread sampling-fd lifecycle.
//!
//! Concurrency model: the engine thread owns all mutable state. A small
//! stats thread reads ring fill levels through an `RwLock` snapshot the
//! engine refreshes each iteration; `exit_requested` is the only other
//! shared bit.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::clock::{Clock, MonotonicClock};
use super::config::{InstrumentedFunction, TracerConfig};
use super::cpus::online_cpus;
use super::event::{MapsEvent, TaskEvent, TracerEvent};
use super::perf_sys;
use super::processor::PerfEventProcessor;
use super::record::{
    self, PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP,
    PERF_RECORD_SAMPLE, PERF_RECORD_SWITCH, PERF_RECORD_SWITCH_CPU_WIDE,
};
use super::ring_buffer::PerfRingBuffer;
use super::visitor::UnwindingVisitor;
use crate::domain::{Pid, Tid, TracerError};
use crate::listener::TraceListener;
use crate::records::{ContextSwitchIn, ContextSwitchOut};
use crate::unwind::{read_maps, Unwinder};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const STATS_INTERVAL: Duration = Duration::from_millis(5);
const EVENT_COUNT_WINDOW_S: u64 = 5;

/// What a ring buffer is attached to, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    ContextSwitch,
    Sampling,
    Uprobe,
    Uretprobe,
}

#[derive(Debug, Clone)]
pub struct RingStat {
    pub fd: RawFd,
    pub kind: RingKind,
    pub queued_bytes: u64,
}

pub struct TracerEngine {
    config: TracerConfig,
}

impl TracerEngine {
    /// # Errors
    /// Returns `TracerError::InvalidConfig` for a configuration that must
    /// not start.
    pub fn new(config: TracerConfig) -> Result<Self, TracerError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the capture until `exit_requested` is observed, then drain and
    /// release every resource.
    ///
    /// # Errors
    /// Setup errors (target gone, no CPU list) abort the run; per-counter
    /// open failures only degrade it.
    #[allow(clippy::too_many_lines)]
    pub fn run<U, L>(
        &self,
        mut unwinder: U,
        listener: L,
        exit_requested: &AtomicBool,
    ) -> Result<(), TracerError>
    where
        U: Unwinder,
        L: TraceListener,
    {
        let pid = self.config.target_pid;
        let initial_maps =
            read_maps(pid).map_err(|_| TracerError::ProcessNotFound(pid))?;
        unwinder.set_maps(initial_maps);

        let listener = Rc::new(RefCell::new(listener));
        let visitor = UnwindingVisitor::new(
            unwinder,
            Rc::clone(&listener),
            self.config.callstacks_on_function_exit,
        );
        let clock = MonotonicClock;
        let mut processor =
            PerfEventProcessor::new(visitor, clock, self.config.processing_delay_ns());
        let mut listener = listener;

        let cpus = online_cpus()?;

        let mut rings: BTreeMap<RawFd, PerfRingBuffer> = BTreeMap::new();
        let mut ring_kinds: HashMap<RawFd, RingKind> = HashMap::new();
        let mut uprobe_functions: HashMap<RawFd, Arc<InstrumentedFunction>> = HashMap::new();
        let mut uretprobe_functions: HashMap<RawFd, Arc<InstrumentedFunction>> = HashMap::new();
        let mut sampling_fds: HashMap<Tid, RawFd> = HashMap::new();

        if self.config.trace_context_switches {
            for &cpu in &cpus {
                match perf_sys::open_context_switch(cpu) {
                    Ok(fd) => {
                        add_ring(&mut rings, &mut ring_kinds, fd, RingKind::ContextSwitch);
                    }
                    Err(e) => warn!("{e}, tracing without context switches on cpu {cpu}"),
                }
            }
        }

        if self.config.trace_instrumented_functions {
            for function in &self.config.instrumented_functions {
                let function = Arc::new(function.clone());
                for &cpu in &cpus {
                    match perf_sys::open_uprobe(
                        &function.binary_path,
                        function.file_offset,
                        cpu,
                    ) {
                        Ok(fd) => {
                            if add_ring(&mut rings, &mut ring_kinds, fd, RingKind::Uprobe) {
                                uprobe_functions.insert(fd, Arc::clone(&function));
                            }
                        }
                        Err(e) => warn!("{e}, skipping entry probe on cpu {cpu}"),
                    }
                    match perf_sys::open_uretprobe(
                        &function.binary_path,
                        function.file_offset,
                        cpu,
                    ) {
                        Ok(fd) => {
                            if add_ring(&mut rings, &mut ring_kinds, fd, RingKind::Uretprobe) {
                                uretprobe_functions.insert(fd, Arc::clone(&function));
                            }
                        }
                        Err(e) => warn!("{e}, skipping return probe on cpu {cpu}"),
                    }
                }
            }
        }

        for tid in list_threads(pid)? {
            listener.on_tid(tid);
            if self.config.trace_callstacks {
                match perf_sys::open_sample(tid, self.config.sampling_period_ns) {
                    Ok(fd) => {
                        if add_ring(&mut rings, &mut ring_kinds, fd, RingKind::Sampling) {
                            sampling_fds.insert(tid, fd);
                        }
                    }
                    Err(e) => warn!("{e}, not sampling tid {tid}"),
                }
            }
        }

        info!(
            "tracing pid {pid} with {} ring buffers across {} cpus",
            rings.len(),
            cpus.len()
        );

        for &fd in rings.keys() {
            if let Err(e) = perf_sys::enable(fd) {
                warn!("failed to enable fd {fd}: {e}");
            }
        }

        let ring_stats: RwLock<Vec<RingStat>> = RwLock::new(Vec::new());
        let stats_stop = AtomicBool::new(false);

        let batch_size = self.config.round_robin_batch_size;
        let mut window_begin_ns = 0u64;
        let mut switch_count = 0u64;
        let mut sample_count = 0u64;
        let mut probe_count = 0u64;
        let mut lost_count = 0u64;
        let mut saw_events = false;

        thread::scope(|scope| {
            scope.spawn(|| run_stats(&ring_stats, &stats_stop));

            while !exit_requested.load(Ordering::Acquire) {
                // Skip the sleep while events are flowing; 1 ms is short
                // enough that no ring overflows at expected rates.
                if !saw_events {
                    thread::sleep(IDLE_SLEEP);
                }
                saw_events = false;

                // Never mutate the ring map mid-iteration.
                let mut rings_to_add: Vec<(RawFd, PerfRingBuffer, RingKind)> = Vec::new();
                let mut fds_to_remove: Vec<RawFd> = Vec::new();

                for (&fd, ring) in &mut rings {
                    if exit_requested.load(Ordering::Acquire) {
                        break;
                    }

                    let mut read_from_this_ring = 0;
                    while ring.has_new_data() && read_from_this_ring < batch_size {
                        read_from_this_ring += 1;
                        saw_events = true;

                        let header = ring.read_header();
                        match header.kind {
                            PERF_RECORD_SWITCH => {
                                let payload = ring.take_payload(&header);
                                match record::parse_context_switch(header.misc, &payload) {
                                    Ok(switch) => {
                                        switch_count += 1;
                                        if switch.tid != Tid(0) {
                                            if switch.is_out {
                                                listener.on_context_switch_out(ContextSwitchOut {
                                                    tid: switch.tid,
                                                    cpu: switch.cpu,
                                                    timestamp_ns: switch.time,
                                                });
                                            } else {
                                                listener.on_context_switch_in(ContextSwitchIn {
                                                    tid: switch.tid,
                                                    cpu: switch.cpu,
                                                    timestamp_ns: switch.time,
                                                });
                                            }
                                        }
                                    }
                                    Err(e) => warn!("bad context-switch record: {e}"),
                                }
                            }

                            PERF_RECORD_SWITCH_CPU_WIDE => {
                                let payload = ring.take_payload(&header);
                                match record::parse_cpu_wide_switch(header.misc, &payload) {
                                    Ok(switch) => {
                                        switch_count += 1;
                                        if switch.prev_tid != Tid(0) {
                                            listener.on_context_switch_out(ContextSwitchOut {
                                                tid: switch.prev_tid,
                                                cpu: switch.cpu,
                                                timestamp_ns: switch.time,
                                            });
                                        }
                                        if switch.next_tid != Tid(0) {
                                            listener.on_context_switch_in(ContextSwitchIn {
                                                tid: switch.next_tid,
                                                cpu: switch.cpu,
                                                timestamp_ns: switch.time,
                                            });
                                        }
                                    }
                                    Err(e) => warn!("bad cpu-wide switch record: {e}"),
                                }
                            }

                            PERF_RECORD_FORK => {
                                let payload = ring.take_payload(&header);
                                match record::parse_task(&payload) {
                                    Ok(fork) if fork.pid == pid.0 => {
                                        listener.on_tid(fork.tid);
                                        if self.config.trace_callstacks
                                            && !sampling_fds.contains_key(&fork.tid)
                                        {
                                            // The ring is mapped right away
                                            // so no records are lost; only
                                            // the map insertion is deferred.
                                            match open_sampling_ring(
                                                fork.tid,
                                                self.config.sampling_period_ns,
                                            ) {
                                                Ok((new_fd, new_ring)) => {
                                                    rings_to_add.push((
                                                        new_fd,
                                                        new_ring,
                                                        RingKind::Sampling,
                                                    ));
                                                    sampling_fds.insert(fork.tid, new_fd);
                                                }
                                                Err(e) => {
                                                    warn!("{e}, not sampling new tid {}", fork.tid);
                                                }
                                            }
                                        }
                                    }
                                    Ok(_) => {}
                                    Err(e) => warn!("bad fork record: {e}"),
                                }
                            }

                            PERF_RECORD_EXIT => {
                                let payload = ring.take_payload(&header);
                                match record::parse_task(&payload) {
                                    Ok(exit) if exit.pid == pid.0 => {
                                        if let Some(sample_fd) = sampling_fds.remove(&exit.tid) {
                                            if let Err(e) = perf_sys::disable(sample_fd) {
                                                warn!("failed to disable fd {sample_fd}: {e}");
                                            }
                                            fds_to_remove.push(sample_fd);
                                        }
                                        processor.add_event(
                                            fd,
                                            TracerEvent::Exit(TaskEvent {
                                                pid: Pid(exit.pid),
                                                tid: exit.tid,
                                                timestamp_ns: exit.time,
                                            }),
                                        );
                                    }
                                    Ok(_) => {}
                                    Err(e) => warn!("bad exit record: {e}"),
                                }
                            }

                            PERF_RECORD_MMAP => {
                                // An executable mapping changed; refresh the
                                // maps snapshot. Rare.
                                ring.skip_record(&header);
                                match read_maps(pid) {
                                    Ok(maps) => processor.add_event(
                                        fd,
                                        TracerEvent::Maps(MapsEvent {
                                            timestamp_ns: clock.monotonic_ns(),
                                            maps,
                                        }),
                                    ),
                                    Err(e) => {
                                        warn!("{e}, keeping previous maps");
                                    }
                                }
                            }

                            PERF_RECORD_SAMPLE => {
                                let payload = ring.take_payload(&header);
                                match parse_sample(
                                    fd,
                                    &payload,
                                    &uprobe_functions,
                                    &uretprobe_functions,
                                ) {
                                    Ok(event) => {
                                        match &event {
                                            TracerEvent::StackSample(_) => sample_count += 1,
                                            _ => probe_count += 1,
                                        }
                                        processor.add_event(fd, event);
                                    }
                                    Err(e) => warn!("bad sample record: {e}"),
                                }
                            }

                            PERF_RECORD_LOST => {
                                let payload = ring.take_payload(&header);
                                match record::parse_lost(&payload) {
                                    Ok(lost) => {
                                        warn!("kernel lost {} events on fd {fd}", lost.count);
                                        lost_count += lost.count;
                                    }
                                    Err(e) => warn!("bad lost record: {e}"),
                                }
                            }

                            other => {
                                error!("unexpected perf record type {other}, skipping");
                                ring.skip_record(&header);
                            }
                        }

                        log_event_rates(
                            &clock,
                            &mut window_begin_ns,
                            &mut switch_count,
                            &mut sample_count,
                            &mut probe_count,
                            &mut lost_count,
                        );
                    }
                }

                processor.process_old_events();

                for (fd, ring, kind) in rings_to_add {
                    rings.insert(fd, ring);
                    ring_kinds.insert(fd, kind);
                }
                for fd in fds_to_remove {
                    rings.remove(&fd);
                    ring_kinds.remove(&fd);
                    if let Err(e) = perf_sys::close_fd(fd) {
                        warn!("failed to close fd {fd}: {e}");
                    }
                }

                if let Ok(mut stats) = ring_stats.write() {
                    stats.clear();
                    stats.extend(rings.iter().map(|(&fd, ring)| RingStat {
                        fd,
                        kind: ring_kinds.get(&fd).copied().unwrap_or(RingKind::Sampling),
                        queued_bytes: ring.current_size(),
                    }));
                }
            }

            stats_stop.store(true, Ordering::Release);
        });

        info!("draining {} queued events", processor.queued_events());
        processor.process_all_events();

        for &fd in rings.keys() {
            if let Err(e) = perf_sys::disable(fd) {
                warn!("failed to disable fd {fd}: {e}");
            }
            if let Err(e) = perf_sys::close_fd(fd) {
                warn!("failed to close fd {fd}: {e}");
            }
        }
        rings.clear();

        Ok(())
    }
}

/// Map the ring for a freshly opened counter; on mmap failure the fd is
/// closed and the counter dropped.
fn add_ring(
    rings: &mut BTreeMap<RawFd, PerfRingBuffer>,
    ring_kinds: &mut HashMap<RawFd, RingKind>,
    fd: RawFd,
    kind: RingKind,
) -> bool {
    match PerfRingBuffer::new(fd) {
        Ok(ring) => {
            rings.insert(fd, ring);
            ring_kinds.insert(fd, kind);
            true
        }
        Err(e) => {
            warn!("{e}, dropping counter fd {fd}");
            if let Err(e) = perf_sys::close_fd(fd) {
                warn!("failed to close fd {fd}: {e}");
            }
            false
        }
    }
}

/// Open, map and enable a sampling counter for a thread spawned mid-run.
fn open_sampling_ring(
    tid: Tid,
    period_ns: u64,
) -> Result<(RawFd, PerfRingBuffer), TracerError> {
    let fd = perf_sys::open_sample(tid, period_ns)?;
    let ring = match PerfRingBuffer::new(fd) {
        Ok(ring) => ring,
        Err(e) => {
            if let Err(close_err) = perf_sys::close_fd(fd) {
                warn!("failed to close fd {fd}: {close_err}");
            }
            return Err(e);
        }
    };
    if let Err(e) = perf_sys::enable(fd) {
        warn!("failed to enable fd {fd}: {e}");
    }
    Ok((fd, ring))
}

/// Classify a sample by the fd it arrived on: entry probe, return probe, or
/// plain stack sample.
fn parse_sample(
    fd: RawFd,
    payload: &[u8],
    uprobe_functions: &HashMap<RawFd, Arc<InstrumentedFunction>>,
    uretprobe_functions: &HashMap<RawFd, Arc<InstrumentedFunction>>,
) -> std::io::Result<TracerEvent> {
    let sample = record::parse_stack_sample(payload)?;
    let event = if let Some(function) = uprobe_functions.get(&fd) {
        TracerEvent::UprobeHit(super::event::ProbeEvent {
            tid: sample.tid,
            timestamp_ns: sample.time,
            regs: sample.regs,
            stack: sample.stack,
            function: Arc::clone(function),
        })
    } else if let Some(function) = uretprobe_functions.get(&fd) {
        TracerEvent::UretprobeHit(super::event::ProbeEvent {
            tid: sample.tid,
            timestamp_ns: sample.time,
            regs: sample.regs,
            stack: sample.stack,
            function: Arc::clone(function),
        })
    } else {
        TracerEvent::StackSample(super::event::StackSampleEvent {
            tid: sample.tid,
            cpu: sample.cpu,
            timestamp_ns: sample.time,
            regs: sample.regs,
            stack: sample.stack,
        })
    };
    Ok(event)
}

fn log_event_rates(
    clock: &MonotonicClock,
    window_begin_ns: &mut u64,
    switch_count: &mut u64,
    sample_count: &mut u64,
    probe_count: &mut u64,
    lost_count: &mut u64,
) {
    let now = clock.monotonic_ns();
    if *window_begin_ns == 0 {
        *window_begin_ns = now;
        return;
    }
    if *window_begin_ns + EVENT_COUNT_WINDOW_S * 1_000_000_000 >= now {
        return;
    }

    info!(
        "events per second (last {EVENT_COUNT_WINDOW_S} s): \
         sched switches: {}; samples: {}; u(ret)probes: {}; lost: {}",
        *switch_count / EVENT_COUNT_WINDOW_S,
        *sample_count / EVENT_COUNT_WINDOW_S,
        *probe_count / EVENT_COUNT_WINDOW_S,
        *lost_count,
    );
    *switch_count = 0;
    *sample_count = 0;
    *probe_count = 0;
    *lost_count = 0;
    *window_begin_ns = now;
}

/// Periodically report rings with queued data. Reads only the snapshot the
/// engine publishes; never touches the rings themselves.
fn run_stats(ring_stats: &RwLock<Vec<RingStat>>, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        thread::sleep(STATS_INTERVAL);
        let Ok(stats) = ring_stats.read() else {
            return;
        };
        for stat in stats.iter().filter(|s| s.queued_bytes > 0) {
            debug!(
                "ring buffer {:?} fd {} has {} bytes queued",
                stat.kind, stat.fd, stat.queued_bytes
            );
        }
    }
}

/// Enumerate the target's threads from `/proc/<pid>/task`.
///
/// # Errors
/// Fails when the directory cannot be read, i.e. the process is gone.
pub fn list_threads(pid: Pid) -> Result<Vec<Tid>, TracerError> {
    let path = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&path).map_err(|source| TracerError::ProcRead {
        path: path.clone(),
        source,
    })?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TracerError::ProcRead {
            path: path.clone(),
            source,
        })?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(Tid(tid));
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::config::TracerConfig;

    #[test]
    fn test_list_threads_self() {
        let tids = list_threads(Pid(std::process::id() as i32)).unwrap();
        assert!(!tids.is_empty());
    }

    #[test]
    fn test_list_threads_missing_process() {
        assert!(list_threads(Pid(-1)).is_err());
    }

    #[test]
    fn test_engine_rejects_bad_config() {
        let mut config = TracerConfig::new(Pid(1));
        config.round_robin_batch_size = 0;
        assert!(TracerEngine::new(config).is_err());
    }
}
