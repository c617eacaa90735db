//! Normalized tracing records emitted to the listener
//!
//! These are the output data model of the tracer: everything the engine
//! learns from the kernel is reduced to one of the record types below before
//! it crosses the listener boundary. Addresses are left unsymbolicated; a
//! downstream consumer owns name resolution.

use serde::Serialize;

use crate::domain::{CpuId, Tid};

/// One frame of a reconstructed callstack, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallstackFrame {
    pub pc: u64,
    /// Present only when the unwinder could name the frame.
    pub function_name: Option<String>,
    pub function_offset: u64,
    /// Name of the mapped region containing `pc`, e.g. a binary path or
    /// `[uprobes]` for the kernel trampoline.
    pub map_name: String,
}

/// A complete callstack for one thread at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Callstack {
    pub tid: Tid,
    /// Frames ordered leaf to root.
    pub frames: Vec<CallstackFrame>,
    pub timestamp_ns: u64,
}

/// A matched entry/exit pair of an instrumented function.
///
/// `begin_timestamp_ns < end_timestamp_ns` always holds; within a thread the
/// intervals nest strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionCall {
    pub tid: Tid,
    pub virtual_address: u64,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
    /// Number of still-open calls on the thread after this call returned.
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionBegin {
    pub tid: Tid,
    pub virtual_address: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionEnd {
    pub tid: Tid,
    pub virtual_address: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextSwitchIn {
    pub tid: Tid,
    pub cpu: CpuId,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextSwitchOut {
    pub tid: Tid,
    pub cpu: CpuId,
    pub timestamp_ns: u64,
}

/// Umbrella type for forwarding records over a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TraceRecord {
    TidSeen(Tid),
    ContextSwitchIn(ContextSwitchIn),
    ContextSwitchOut(ContextSwitchOut),
    FunctionCall(FunctionCall),
    FunctionBegin(FunctionBegin),
    FunctionEnd(FunctionEnd),
    Callstack(Callstack),
}
