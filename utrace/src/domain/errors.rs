//! Structured error types for utrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::io;

use thiserror::Error;

use super::types::{CpuId, Pid, Tid};

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    #[error("failed to open {kind} counter (cpu {cpu}, tid {tid}): {source}")]
    CounterOpen {
        kind: &'static str,
        cpu: i32,
        tid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to mmap ring buffer for fd {fd}: {source}")]
    RingBufferMmap {
        fd: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    ProcRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed line in {path}: {line:?}")]
    MapsParse { path: String, line: String },

    #[error("uprobe PMU is not available: {0}")]
    UprobePmuUnavailable(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TracerError {
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn counter_open(kind: &'static str, cpu: CpuId, tid: Tid, source: io::Error) -> Self {
        Self::CounterOpen {
            kind,
            cpu: cpu.0 as i32,
            tid: tid.0,
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to write trace file: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
