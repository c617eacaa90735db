//! Monotonic clock
//!
//! Perf records carry `CLOCK_MONOTONIC` nanosecond timestamps; the processor
//! compares them against wall progress on the same clock, so `Instant` is
//! not usable here. The trait exists so tests can script time.

pub trait Clock {
    /// Current `CLOCK_MONOTONIC` time in nanoseconds.
    fn monotonic_ns(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[allow(unsafe_code)]
    fn monotonic_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime cannot fail for CLOCK_MONOTONIC with a valid pointer.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        u64::try_from(ts.tv_sec).unwrap_or(0) * 1_000_000_000 + u64::try_from(ts.tv_nsec).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.monotonic_ns();
        let b = clock.monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
