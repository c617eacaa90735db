//! Perf wire-record parsing
//!
//! Layouts here mirror what the counters in `perf_sys` request: every
//! counter uses `sample_id_all` with TID | TIME | CPU, so non-sample records
//! carry a 24-byte sample-id trailer, and sample records begin with the same
//! identifier fields inline. Stack samples additionally carry the user
//! register dump and the stack snapshot.

use std::io::{self, Cursor, Read};

use byteorder::{NativeEndian, ReadBytesExt};

use crate::domain::{CpuId, Tid};
use crate::unwind::Registers;

use super::perf_sys::SAMPLE_REGS_USER_COUNT;

// enum perf_event_type
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

/// `perf_event_header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            kind: u32::from_ne_bytes(bytes[0..4].try_into().expect("4 bytes")),
            misc: u16::from_ne_bytes(bytes[4..6].try_into().expect("2 bytes")),
            size: u16::from_ne_bytes(bytes[6..8].try_into().expect("2 bytes")),
        }
    }
}

/// Identifier fields shared by every record: inline at the front of samples,
/// as a trailer on everything else (`sample_id_all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleId {
    pub pid: i32,
    pub tid: Tid,
    pub time: u64,
    pub cpu: CpuId,
}

const SAMPLE_ID_TRAILER_SIZE: usize = 24;

impl SampleId {
    fn parse<R: Read>(reader: &mut R) -> io::Result<Self> {
        let pid = reader.read_i32::<NativeEndian>()?;
        let tid = Tid(reader.read_i32::<NativeEndian>()?);
        let time = reader.read_u64::<NativeEndian>()?;
        let cpu = CpuId(reader.read_u32::<NativeEndian>()?);
        let _res = reader.read_u32::<NativeEndian>()?;
        Ok(Self {
            pid,
            tid,
            time,
            cpu,
        })
    }

    fn parse_trailer(payload: &[u8]) -> io::Result<Self> {
        let start = payload
            .len()
            .checked_sub(SAMPLE_ID_TRAILER_SIZE)
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        Self::parse(&mut Cursor::new(&payload[start..]))
    }
}

/// PERF_RECORD_SWITCH, reduced to the fields the engine forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitchRecord {
    pub tid: Tid,
    pub cpu: CpuId,
    pub time: u64,
    pub is_out: bool,
}

/// # Errors
/// Fails on a truncated payload.
pub fn parse_context_switch(
    misc: u16,
    payload: &[u8],
) -> io::Result<ContextSwitchRecord> {
    let id = SampleId::parse_trailer(payload)?;
    Ok(ContextSwitchRecord {
        tid: id.tid,
        cpu: id.cpu,
        time: id.time,
        is_out: misc & PERF_RECORD_MISC_SWITCH_OUT != 0,
    })
}

/// PERF_RECORD_SWITCH_CPU_WIDE with both sides of the switch resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuWideSwitchRecord {
    pub prev_tid: Tid,
    pub next_tid: Tid,
    pub cpu: CpuId,
    pub time: u64,
}

/// # Errors
/// Fails on a truncated payload.
pub fn parse_cpu_wide_switch(misc: u16, payload: &[u8]) -> io::Result<CpuWideSwitchRecord> {
    let mut cursor = Cursor::new(payload);
    let _next_prev_pid = cursor.read_i32::<NativeEndian>()?;
    let next_prev_tid = Tid(cursor.read_i32::<NativeEndian>()?);
    let id = SampleId::parse_trailer(payload)?;

    // With SWITCH_OUT set the record's own tid is the outgoing thread and
    // next_prev is the incoming one; otherwise the roles flip.
    let (prev_tid, next_tid) = if misc & PERF_RECORD_MISC_SWITCH_OUT != 0 {
        (id.tid, next_prev_tid)
    } else {
        (next_prev_tid, id.tid)
    };

    Ok(CpuWideSwitchRecord {
        prev_tid,
        next_tid,
        cpu: id.cpu,
        time: id.time,
    })
}

/// PERF_RECORD_FORK / PERF_RECORD_EXIT share this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub pid: i32,
    pub tid: Tid,
    pub time: u64,
}

/// # Errors
/// Fails on a truncated payload.
pub fn parse_task(payload: &[u8]) -> io::Result<TaskRecord> {
    let mut cursor = Cursor::new(payload);
    let pid = cursor.read_i32::<NativeEndian>()?;
    let _ppid = cursor.read_i32::<NativeEndian>()?;
    let tid = Tid(cursor.read_i32::<NativeEndian>()?);
    let _ptid = cursor.read_i32::<NativeEndian>()?;
    let time = cursor.read_u64::<NativeEndian>()?;
    Ok(TaskRecord { pid, tid, time })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecord {
    pub count: u64,
}

/// # Errors
/// Fails on a truncated payload.
pub fn parse_lost(payload: &[u8]) -> io::Result<LostRecord> {
    let mut cursor = Cursor::new(payload);
    let _id = cursor.read_u64::<NativeEndian>()?;
    let count = cursor.read_u64::<NativeEndian>()?;
    Ok(LostRecord { count })
}

/// PERF_RECORD_SAMPLE with the register dump and stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSampleRecord {
    pub tid: Tid,
    pub cpu: CpuId,
    pub time: u64,
    pub regs: Registers,
    pub stack: Vec<u8>,
}

/// # Errors
/// Fails on a truncated payload.
pub fn parse_stack_sample(payload: &[u8]) -> io::Result<StackSampleRecord> {
    let mut cursor = Cursor::new(payload);
    let _pid = cursor.read_i32::<NativeEndian>()?;
    let tid = Tid(cursor.read_i32::<NativeEndian>()?);
    let time = cursor.read_u64::<NativeEndian>()?;
    let cpu = CpuId(cursor.read_u32::<NativeEndian>()?);
    let _res = cursor.read_u32::<NativeEndian>()?;

    // PERF_SAMPLE_REGS_USER: abi, then one u64 per mask bit in index order,
    // here [bp, sp, ip]. An abi of NONE means the thread was in kernel
    // context and no registers were captured.
    let abi = cursor.read_u64::<NativeEndian>()?;
    let mut regs = Registers::default();
    if abi != 0 {
        let mut values = [0u64; SAMPLE_REGS_USER_COUNT];
        for value in &mut values {
            *value = cursor.read_u64::<NativeEndian>()?;
        }
        regs = Registers {
            bp: values[0],
            sp: values[1],
            ip: values[2],
        };
    }

    // PERF_SAMPLE_STACK_USER: size, data[size], dyn_size. dyn_size is the
    // portion actually filled.
    let size = cursor.read_u64::<NativeEndian>()?;
    let mut stack = Vec::new();
    if size > 0 {
        stack = vec![0u8; usize::try_from(size).map_err(|_| io::ErrorKind::InvalidData)?];
        cursor.read_exact(&mut stack)?;
        let dyn_size = cursor.read_u64::<NativeEndian>()?;
        stack.truncate(usize::try_from(dyn_size).map_err(|_| io::ErrorKind::InvalidData)?);
    }

    Ok(StackSampleRecord {
        tid,
        cpu,
        time,
        regs,
        stack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn write_sample_id(buf: &mut Vec<u8>, pid: i32, tid: i32, time: u64, cpu: u32) {
        buf.write_i32::<NativeEndian>(pid).unwrap();
        buf.write_i32::<NativeEndian>(tid).unwrap();
        buf.write_u64::<NativeEndian>(time).unwrap();
        buf.write_u32::<NativeEndian>(cpu).unwrap();
        buf.write_u32::<NativeEndian>(0).unwrap();
    }

    #[test]
    fn test_header_from_bytes() {
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&PERF_RECORD_SAMPLE.to_ne_bytes());
        bytes[4..6].copy_from_slice(&0u16.to_ne_bytes());
        bytes[6..8].copy_from_slice(&64u16.to_ne_bytes());
        let header = RecordHeader::from_bytes(&bytes);
        assert_eq!(header.kind, PERF_RECORD_SAMPLE);
        assert_eq!(header.size, 64);
    }

    #[test]
    fn test_parse_context_switch_out() {
        let mut payload = Vec::new();
        write_sample_id(&mut payload, 10, 11, 5000, 2);
        let record = parse_context_switch(PERF_RECORD_MISC_SWITCH_OUT, &payload).unwrap();
        assert_eq!(record.tid, Tid(11));
        assert_eq!(record.cpu, CpuId(2));
        assert_eq!(record.time, 5000);
        assert!(record.is_out);
    }

    #[test]
    fn test_parse_cpu_wide_switch_roles() {
        let mut payload = Vec::new();
        payload.write_i32::<NativeEndian>(20).unwrap(); // next_prev_pid
        payload.write_i32::<NativeEndian>(21).unwrap(); // next_prev_tid
        write_sample_id(&mut payload, 10, 11, 7000, 0);

        // Switch-out: record tid is the outgoing thread.
        let out = parse_cpu_wide_switch(PERF_RECORD_MISC_SWITCH_OUT, &payload).unwrap();
        assert_eq!(out.prev_tid, Tid(11));
        assert_eq!(out.next_tid, Tid(21));

        // Switch-in: roles flip.
        let inward = parse_cpu_wide_switch(0, &payload).unwrap();
        assert_eq!(inward.prev_tid, Tid(21));
        assert_eq!(inward.next_tid, Tid(11));
    }

    #[test]
    fn test_parse_task() {
        let mut payload = Vec::new();
        payload.write_i32::<NativeEndian>(100).unwrap();
        payload.write_i32::<NativeEndian>(1).unwrap();
        payload.write_i32::<NativeEndian>(101).unwrap();
        payload.write_i32::<NativeEndian>(1).unwrap();
        payload.write_u64::<NativeEndian>(12345).unwrap();
        write_sample_id(&mut payload, 100, 101, 12345, 3);

        let record = parse_task(&payload).unwrap();
        assert_eq!(record.pid, 100);
        assert_eq!(record.tid, Tid(101));
        assert_eq!(record.time, 12345);
    }

    #[test]
    fn test_parse_lost() {
        let mut payload = Vec::new();
        payload.write_u64::<NativeEndian>(42).unwrap();
        payload.write_u64::<NativeEndian>(7).unwrap();
        write_sample_id(&mut payload, 1, 1, 1, 0);
        assert_eq!(parse_lost(&payload).unwrap().count, 7);
    }

    #[test]
    fn test_parse_stack_sample() {
        let mut payload = Vec::new();
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_i32::<NativeEndian>(11).unwrap();
        payload.write_u64::<NativeEndian>(9000).unwrap();
        payload.write_u32::<NativeEndian>(1).unwrap();
        payload.write_u32::<NativeEndian>(0).unwrap();
        payload.write_u64::<NativeEndian>(2).unwrap(); // abi: 64-bit
        payload.write_u64::<NativeEndian>(0x7000).unwrap(); // bp
        payload.write_u64::<NativeEndian>(0x6ff0).unwrap(); // sp
        payload.write_u64::<NativeEndian>(0x1234).unwrap(); // ip
        payload.write_u64::<NativeEndian>(16).unwrap(); // size
        payload.extend_from_slice(&[0xAB; 16]);
        payload.write_u64::<NativeEndian>(8).unwrap(); // dyn_size

        let record = parse_stack_sample(&payload).unwrap();
        assert_eq!(record.tid, Tid(11));
        assert_eq!(record.time, 9000);
        assert_eq!(record.regs.ip, 0x1234);
        assert_eq!(record.regs.sp, 0x6ff0);
        assert_eq!(record.regs.bp, 0x7000);
        assert_eq!(record.stack.len(), 8); // truncated to dyn_size
    }

    #[test]
    fn test_parse_stack_sample_no_regs() {
        let mut payload = Vec::new();
        payload.write_i32::<NativeEndian>(10).unwrap();
        payload.write_i32::<NativeEndian>(11).unwrap();
        payload.write_u64::<NativeEndian>(9000).unwrap();
        payload.write_u32::<NativeEndian>(1).unwrap();
        payload.write_u32::<NativeEndian>(0).unwrap();
        payload.write_u64::<NativeEndian>(0).unwrap(); // abi NONE
        payload.write_u64::<NativeEndian>(0).unwrap(); // stack size 0

        let record = parse_stack_sample(&payload).unwrap();
        assert_eq!(record.regs, Registers::default());
        assert!(record.stack.is_empty());
    }

    #[test]
    fn test_truncated_payload_errors() {
        assert!(parse_task(&[0u8; 4]).is_err());
        assert!(parse_context_switch(0, &[0u8; 8]).is_err());
    }
}
