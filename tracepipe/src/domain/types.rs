//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep thread ids, process ids and CPU numbers from
//! being mixed up on their way from the OS into queue records.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// Records only carry the low 32 bits of a thread id, so this is the unit the
/// resolver and drain work in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl Tid {
    /// OS id of the calling thread.
    #[must_use]
    #[allow(unsafe_code, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn current() -> Self {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: gettid takes no arguments and cannot fail.
            Tid(unsafe { libc::syscall(libc::SYS_gettid) } as u32)
        }
        #[cfg(windows)]
        {
            // SAFETY: GetCurrentThreadId takes no arguments and cannot fail.
            Tid(unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() })
        }
        #[cfg(not(any(target_os = "linux", windows)))]
        {
            use std::sync::atomic::{AtomicU32, Ordering};
            static NEXT: AtomicU32 = AtomicU32::new(1);
            thread_local! {
                static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
            }
            Tid(ID.with(|id| *id))
        }
    }

    /// Thread id stored in a record field (upper 32 bits are always zero).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_record(raw: u64) -> Self {
        Tid(raw as u32)
    }

    #[must_use]
    pub fn as_record(self) -> u64 {
        u64::from(self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// CPU ID
///
/// Represents a CPU core ID (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Record byte for this CPU; numbers above 255 wrap.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_record(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_record_roundtrip() {
        assert_eq!(Tid::from_record(0x1_0000_0007), Tid(7));
        assert_eq!(Tid(42).as_record(), 42);
    }

    #[test]
    fn test_current_differs_across_threads() {
        let here = Tid::current();
        let there = std::thread::spawn(Tid::current).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, Tid::current());
    }

    #[test]
    fn test_display() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
        assert_eq!(Tid(5).to_string(), "TID:5");
        assert_eq!(CpuId(3).to_string(), "CPU:3");
        assert_eq!(CpuId(259).as_record(), 3);
    }
}
