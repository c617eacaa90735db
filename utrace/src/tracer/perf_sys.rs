//! Kernel counter API (`perf_event_open` and friends)
//!
//! Thin, fully-owned wrapper over the syscall: every counter the engine uses
//! is opened through one of the functions below and controlled with the
//! enable/disable ioctls. The attr struct is declared by hand at
//! `PERF_ATTR_SIZE_VER5`; only the fields this tracer sets are exposed.
//!
//! Contract for callers: each returned fd backs exactly one mmap'd ring
//! buffer, stays disabled until `enable` is called, and must be closed with
//! `close_fd` on shutdown.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use crate::domain::{CpuId, Tid, TracerError};

// perf_event_attr.type
const PERF_TYPE_SOFTWARE: u32 = 1;

// perf_event_attr.config for PERF_TYPE_SOFTWARE
const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
const PERF_COUNT_SW_DUMMY: u64 = 9;

// perf_event_attr.sample_type
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

// perf_event_attr bitfield flags
const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_FLAG_MMAP: u64 = 1 << 8;
const ATTR_FLAG_TASK: u64 = 1 << 13;
const ATTR_FLAG_SAMPLE_ID_ALL: u64 = 1 << 18;
const ATTR_FLAG_CONTEXT_SWITCH: u64 = 1 << 26;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

// x86_64 user register indices (asm/perf_regs.h): BP=6, SP=7, IP=8.
// Regs are dumped in index order, so samples carry [bp, sp, ip].
pub const SAMPLE_REGS_USER_MASK: u64 = (1 << 6) | (1 << 7) | (1 << 8);
pub const SAMPLE_REGS_USER_COUNT: usize = 3;

/// Bytes of user stack dumped with each sample. Must be a multiple of 8 and
/// fit the u16 size field of the record.
pub const SAMPLE_STACK_USER_SIZE: u32 = 65528;

const UPROBE_TYPE_PATH: &str = "/sys/bus/event_source/devices/uprobe/type";
const UPROBE_RETPROBE_PATH: &str = "/sys/bus/event_source/devices/uprobe/format/retprobe";

/// `perf_event_attr` at `PERF_ATTR_SIZE_VER5` (112 bytes). Unused fields
/// stay zeroed; the kernel reads the whole struct.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

impl Default for PerfEventAttr {
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    fn default() -> Self {
        let mut attr: Self = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<Self>() as u32;
        attr
    }
}

#[allow(unsafe_code)]
fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32, group_fd: i32) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            std::ptr::from_ref(attr),
            pid,
            cpu,
            group_fd,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(fd as RawFd)
}

/// Open a per-CPU context-switch counter observing all processes.
///
/// # Errors
/// Typically `EACCES` when `perf_event_paranoid` forbids system-wide
/// tracing without `CAP_PERFMON`.
pub fn open_context_switch(cpu: CpuId) -> Result<RawFd, TracerError> {
    let mut attr = PerfEventAttr::default();
    attr.type_ = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.sample_period = 1;
    attr.sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU;
    attr.flags = ATTR_FLAG_DISABLED
        | ATTR_FLAG_CONTEXT_SWITCH
        | ATTR_FLAG_SAMPLE_ID_ALL
        | ATTR_FLAG_EXCLUDE_KERNEL;

    #[allow(clippy::cast_possible_wrap)]
    perf_event_open(&attr, -1, cpu.0 as i32, -1)
        .map_err(|e| TracerError::counter_open("context-switch", cpu, Tid(-1), e))
}

/// Open a periodic stack-sampling counter for one thread. The same fd also
/// delivers MMAP and FORK/EXIT task records for the thread.
///
/// # Errors
/// Fails when the thread is gone or the perf limits are exhausted.
pub fn open_sample(tid: Tid, period_ns: u64) -> Result<RawFd, TracerError> {
    let mut attr = PerfEventAttr::default();
    attr.type_ = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_period = period_ns;
    attr.sample_type = PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_REGS_USER
        | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_MASK;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE;
    attr.flags = ATTR_FLAG_DISABLED
        | ATTR_FLAG_MMAP
        | ATTR_FLAG_TASK
        | ATTR_FLAG_SAMPLE_ID_ALL
        | ATTR_FLAG_EXCLUDE_KERNEL;

    perf_event_open(&attr, tid.0, -1, -1)
        .map_err(|e| TracerError::counter_open("sampling", CpuId(u32::MAX), tid, e))
}

/// Open an entry probe on `binary_path` + `file_offset` for one CPU.
///
/// # Errors
/// Fails when the uprobe PMU is missing or the probe cannot be created.
pub fn open_uprobe(binary_path: &str, file_offset: u64, cpu: CpuId) -> Result<RawFd, TracerError> {
    open_probe(binary_path, file_offset, cpu, false)
}

/// Open a return probe on `binary_path` + `file_offset` for one CPU.
///
/// # Errors
/// Fails when the uprobe PMU is missing or the probe cannot be created.
pub fn open_uretprobe(
    binary_path: &str,
    file_offset: u64,
    cpu: CpuId,
) -> Result<RawFd, TracerError> {
    open_probe(binary_path, file_offset, cpu, true)
}

fn open_probe(
    binary_path: &str,
    file_offset: u64,
    cpu: CpuId,
    retprobe: bool,
) -> Result<RawFd, TracerError> {
    let pmu_type = uprobe_pmu_type()?;
    let path = CString::new(binary_path)
        .map_err(|_| TracerError::InvalidConfig(format!("binary path {binary_path:?} has NUL")))?;

    let mut attr = PerfEventAttr::default();
    attr.type_ = pmu_type;
    attr.config = if retprobe {
        1 << uprobe_retprobe_bit()?
    } else {
        0
    };
    attr.config1 = path.as_ptr() as u64;
    attr.config2 = file_offset;
    attr.sample_period = 1;
    attr.sample_type = PERF_SAMPLE_TID
        | PERF_SAMPLE_TIME
        | PERF_SAMPLE_CPU
        | PERF_SAMPLE_REGS_USER
        | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_MASK;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE;
    attr.flags = ATTR_FLAG_DISABLED | ATTR_FLAG_SAMPLE_ID_ALL;

    let kind = if retprobe { "uretprobe" } else { "uprobe" };
    #[allow(clippy::cast_possible_wrap)]
    perf_event_open(&attr, -1, cpu.0 as i32, -1)
        .map_err(|e| TracerError::counter_open(kind, cpu, Tid(-1), e))
}

/// PMU type id of the uprobe event source.
fn uprobe_pmu_type() -> Result<u32, TracerError> {
    let content = fs::read_to_string(UPROBE_TYPE_PATH)
        .map_err(|e| TracerError::UprobePmuUnavailable(e.to_string()))?;
    content
        .trim()
        .parse()
        .map_err(|_| TracerError::UprobePmuUnavailable(format!("bad type file: {content:?}")))
}

/// Bit in `config` that turns a uprobe into a uretprobe, from the PMU's
/// format description (`config:N`).
fn uprobe_retprobe_bit() -> Result<u32, TracerError> {
    let content = fs::read_to_string(UPROBE_RETPROBE_PATH)
        .map_err(|e| TracerError::UprobePmuUnavailable(e.to_string()))?;
    content
        .trim()
        .strip_prefix("config:")
        .and_then(|bit| bit.parse().ok())
        .ok_or_else(|| {
            TracerError::UprobePmuUnavailable(format!("bad retprobe format: {content:?}"))
        })
}

#[allow(unsafe_code)]
pub fn enable(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[allow(unsafe_code)]
pub fn disable(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_DISABLE, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[allow(unsafe_code)]
pub fn close_fd(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_is_ver5_sized() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
    }

    #[test]
    fn test_regs_mask_matches_count() {
        assert_eq!(
            SAMPLE_REGS_USER_MASK.count_ones() as usize,
            SAMPLE_REGS_USER_COUNT
        );
    }

    #[test]
    fn test_stack_size_is_8_aligned() {
        assert_eq!(SAMPLE_STACK_USER_SIZE % 8, 0);
    }
}
