//! Memory-mapped perf ring buffer
//!
//! One ring per counter fd. The kernel writes records after `data_head`
//! (released with a store-release); userspace consumes from `data_tail` and
//! publishes progress with a store-release of its own. Single reader, no
//! locking: the engine thread is the only consumer.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::record::RecordHeader;
use crate::domain::TracerError;

/// Ring data area size in pages; must be a power of two. One extra page
/// holds the metadata header.
pub const RING_BUFFER_DATA_PAGES: usize = 64;

/// Leading fields of `perf_event_mmap_page`. The 928-byte pad keeps
/// `data_head` at its ABI offset of 1024.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    reserved: [u8; 928],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

pub struct PerfRingBuffer {
    base: *mut u8,
    mmap_len: usize,
    data_offset: u64,
    data_size: u64,
}

impl PerfRingBuffer {
    /// Map the ring for `fd`. The fd stays owned by the caller; dropping the
    /// ring only unmaps the memory.
    ///
    /// # Errors
    /// Fails when the kernel refuses the mmap (usually the locked-memory
    /// limit for unprivileged users).
    #[allow(unsafe_code)]
    pub fn new(fd: RawFd) -> Result<Self, TracerError> {
        #[allow(clippy::cast_sign_loss)]
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let mmap_len = (RING_BUFFER_DATA_PAGES + 1) * page_size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(TracerError::RingBufferMmap {
                fd,
                source: io::Error::last_os_error(),
            });
        }

        let base = base.cast::<u8>();
        let page = base.cast::<PerfEventMmapPage>();
        // data_offset/data_size are fixed once the mapping exists.
        let (data_offset, data_size) =
            unsafe { ((*page).data_offset, (*page).data_size) };

        Ok(Self {
            base,
            mmap_len,
            data_offset,
            data_size,
        })
    }

    #[allow(unsafe_code)]
    fn head(&self) -> u64 {
        // Acquire pairs with the kernel's release store of data_head.
        unsafe {
            let page = self.base.cast::<PerfEventMmapPage>();
            (*ptr::addr_of!((*page).data_head).cast::<AtomicU64>()).load(Ordering::Acquire)
        }
    }

    #[allow(unsafe_code)]
    fn tail(&self) -> u64 {
        // Only this thread writes the tail; a plain read is enough.
        unsafe {
            let page = self.base.cast::<PerfEventMmapPage>();
            ptr::read(ptr::addr_of!((*page).data_tail))
        }
    }

    #[allow(unsafe_code)]
    fn set_tail(&mut self, tail: u64) {
        // Release publishes that the bytes before `tail` are consumed.
        unsafe {
            let page = self.base.cast::<PerfEventMmapPage>();
            (*ptr::addr_of!((*page).data_tail).cast::<AtomicU64>())
                .store(tail, Ordering::Release);
        }
    }

    /// Copy `len` ring bytes starting `from` bytes past the tail, handling
    /// wraparound.
    #[allow(unsafe_code)]
    fn copy_from_ring(&self, from: u64, buf: &mut [u8]) {
        let start = (self.tail() + from) % self.data_size;
        #[allow(clippy::cast_possible_truncation)]
        let start = start as usize;
        #[allow(clippy::cast_possible_truncation)]
        let data_size = self.data_size as usize;

        #[allow(clippy::cast_possible_truncation)]
        let data = unsafe { self.base.add(self.data_offset as usize) };
        let first = buf.len().min(data_size - start);
        unsafe {
            ptr::copy_nonoverlapping(data.add(start), buf.as_mut_ptr(), first);
            if first < buf.len() {
                ptr::copy_nonoverlapping(data, buf.as_mut_ptr().add(first), buf.len() - first);
            }
        }
    }

    pub fn has_new_data(&self) -> bool {
        self.head() != self.tail()
    }

    /// Bytes currently queued in the ring.
    pub fn current_size(&self) -> u64 {
        self.head().wrapping_sub(self.tail())
    }

    /// Peek the header of the next record without consuming it. Callers must
    /// check `has_new_data` first.
    pub fn read_header(&self) -> RecordHeader {
        let mut bytes = [0u8; RecordHeader::SIZE];
        self.copy_from_ring(0, &mut bytes);
        RecordHeader::from_bytes(&bytes)
    }

    /// Consume the record described by `header` and return its payload (the
    /// bytes after the header).
    pub fn take_payload(&mut self, header: &RecordHeader) -> Vec<u8> {
        let payload_len = usize::from(header.size).saturating_sub(RecordHeader::SIZE);
        let mut payload = vec![0u8; payload_len];
        self.copy_from_ring(RecordHeader::SIZE as u64, &mut payload);
        self.set_tail(self.tail() + u64::from(header.size));
        payload
    }

    /// Consume the record described by `header` without reading its body.
    pub fn skip_record(&mut self, header: &RecordHeader) {
        self.set_tail(self.tail() + u64::from(header.size));
    }
}

impl Drop for PerfRingBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.mmap_len);
        }
    }
}

// The mapping is only touched from the engine thread, but the struct has to
// cross into the thread that runs the engine.
#[allow(unsafe_code)]
unsafe impl Send for PerfRingBuffer {}
