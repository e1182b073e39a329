//! Tick source shared by instrumentation and the system trace collectors
//!
//! Ticks are stored verbatim in records; converting them to wall time is the
//! viewer's job. With the `hw-timer` feature on x86-64 the source is the CPU
//! timestamp counter, which is also what ftrace's `x86-tsc` clock reports.
//! Otherwise it is `CLOCK_MONOTONIC_RAW`, matching ftrace's `mono_raw`.

#![allow(unsafe_code)] // rdtsc and clock_gettime

/// Short name of the active tick source, for diagnostics
#[cfg(all(feature = "hw-timer", target_arch = "x86_64"))]
pub const SOURCE: &str = "rdtsc";

#[cfg(all(not(all(feature = "hw-timer", target_arch = "x86_64")), target_os = "linux"))]
pub const SOURCE: &str = "CLOCK_MONOTONIC_RAW";

#[cfg(all(not(all(feature = "hw-timer", target_arch = "x86_64")), not(target_os = "linux")))]
pub const SOURCE: &str = "monotonic";

/// Current tick count.
#[cfg(all(feature = "hw-timer", target_arch = "x86_64"))]
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn now() -> i64 {
    // SAFETY: rdtsc has no memory effects and is available on every x86-64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() as i64 }
}

/// Current tick count in nanoseconds.
#[cfg(all(not(all(feature = "hw-timer", target_arch = "x86_64")), target_os = "linux"))]
#[inline]
#[must_use]
pub fn now() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC_RAW exists on every supported kernel.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    i64::from(ts.tv_sec) * 1_000_000_000 + i64::from(ts.tv_nsec)
}

/// Current tick count in nanoseconds since first use.
#[cfg(all(not(all(feature = "hw-timer", target_arch = "x86_64")), not(target_os = "linux")))]
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(!SOURCE.is_empty());
    }
}
