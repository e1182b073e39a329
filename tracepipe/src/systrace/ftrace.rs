//! Linux ftrace backend
//!
//! Enables the `sched_switch` and `sched_wakeup` tracepoints through tracefs and
//! parses `trace_pipe` line by line:
//!
//! ```text
//!   <idle>-0     [003] d..2.  5000.123456: sched_switch: prev_pid=0 prev_state=R ==> next_pid=200
//!                 ^cpu        ^timestamp    ^tag          ^key=value fields
//! ```
//!
//! tracefs access sits behind [`TraceFs`] so the start sequence and the worker
//! loop run against a temporary directory or an in-memory pipe in tests.

#![allow(unsafe_code)] // eventfd and poll on the trace pipe

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use tracepipe_common::{state_from_ftrace, QueueItem, REASON_UNKNOWN};

use super::{ConnectionStatus, EventSink, Lifecycle, SysTrace};
use crate::domain::{CpuId, SysTraceError};

/// tracefs mount points, in probing order
pub const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

const TRACE_PIPE: &str = "trace_pipe";
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Trace Clock
// ============================================================================

/// Clock ftrace stamps events with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceClock {
    /// Leave `trace_clock` untouched
    Default,
    /// `x86-tsc`: timestamps are raw cycle counts
    Tsc,
    /// `mono_raw`: timestamps are `seconds.fraction`
    MonoRaw,
}

impl TraceClock {
    /// Value written to `trace_clock`, if any.
    #[must_use]
    pub fn option_value(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Tsc => Some("x86-tsc"),
            Self::MonoRaw => Some("mono_raw"),
        }
    }

    /// Trace clock that ticks like [`crate::clock::now`].
    #[must_use]
    pub fn matching_runtime() -> Self {
        if cfg!(all(feature = "hw-timer", target_arch = "x86_64")) {
            Self::Tsc
        } else if cfg!(target_os = "linux") {
            Self::MonoRaw
        } else {
            Self::Default
        }
    }
}

// ============================================================================
// Line Parser
// ============================================================================

/// Decode one `trace_pipe` line into a record.
///
/// Returns `None` for malformed lines and for events other than
/// `sched_switch` / `sched_wakeup`.
#[must_use]
pub fn parse_line(line: &[u8], clock: TraceClock) -> Option<QueueItem> {
    let (cpu, after_cpu) = parse_cpu(line)?;
    let sep = find(after_cpu, b": ")?;
    let time = parse_timestamp(last_token(&after_cpu[..sep])?, clock)?;
    let rest = &after_cpu[sep + 2..];

    if let Some(fields) = rest.strip_prefix(b"sched_switch:") {
        let prev = parse_u32(field(fields, b"prev_pid")?)?;
        let state = *field(fields, b"prev_state")?.first()?;
        let next = parse_u32(field(fields, b"next_pid")?)?;
        Some(QueueItem::context_switch(
            time,
            prev,
            next,
            cpu.as_record(),
            REASON_UNKNOWN,
            state_from_ftrace(state),
        ))
    } else if let Some(fields) = rest.strip_prefix(b"sched_wakeup:") {
        let tid = parse_u32(field(fields, b"pid")?)?;
        Some(QueueItem::thread_wakeup(time, tid))
    } else {
        None
    }
}

/// CPU from the first `[NNN]` field (the `[` may be cut off); returns the bytes after it.
fn parse_cpu(line: &[u8]) -> Option<(CpuId, &[u8])> {
    let mut from = 0;
    while let Some(rel) = line[from..].iter().position(|&b| b == b']') {
        let close = from + rel;
        let digits_start = line[..close]
            .iter()
            .rposition(|b| !b.is_ascii_digit())
            .map_or(0, |i| i + 1);
        let opens_field = digits_start == 0
            || line[digits_start - 1] == b'['
            || line[digits_start - 1].is_ascii_whitespace();
        if digits_start < close && opens_field {
            let cpu = std::str::from_utf8(&line[digits_start..close]).ok()?.parse().ok()?;
            return Some((CpuId(cpu), &line[close + 1..]));
        }
        from = close + 1;
    }
    None
}

/// `5000` (tick count) or `5000.123456` (seconds) into a tick count.
fn parse_timestamp(token: &[u8], clock: TraceClock) -> Option<i64> {
    let dot = token.iter().position(|&b| b == b'.');
    match (clock, dot) {
        (TraceClock::Tsc, Some(dot)) => parse_i64(&token[..dot]),
        (_, None) => parse_i64(token),
        (_, Some(dot)) => {
            let secs = parse_i64(&token[..dot])?;
            let frac = &token[dot + 1..];
            let frac = &frac[..frac.len().min(9)];
            let mut nanos = if frac.is_empty() { 0 } else { parse_i64(frac)? };
            for _ in frac.len()..9 {
                nanos *= 10;
            }
            secs.checked_mul(1_000_000_000)?.checked_add(nanos)
        }
    }
}

/// Value of the first `key=value` token named `key`.
fn field<'a>(fields: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    fields
        .split(u8::is_ascii_whitespace)
        .find_map(|tok| tok.strip_prefix(key)?.strip_prefix(b"="))
}

fn last_token(bytes: &[u8]) -> Option<&[u8]> {
    bytes.split(u8::is_ascii_whitespace).rfind(|tok| !tok.is_empty())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_u32(digits: &[u8]) -> Option<u32> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_i64(digits: &[u8]) -> Option<i64> {
    if digits.first()?.is_ascii_digit() {
        std::str::from_utf8(digits).ok()?.parse().ok()
    } else {
        None
    }
}

// ============================================================================
// tracefs Access
// ============================================================================

/// Operations the collector needs from tracefs
pub trait TraceFs: Send + Sync {
    /// Write `value` to `file` (relative to the tracefs root) in one open/write/close.
    ///
    /// # Errors
    /// Any open or write failure, as [`SysTraceError::TraceFsWrite`].
    fn write(&self, file: &str, value: &str) -> Result<(), SysTraceError>;

    /// Prepare a fresh end-of-stream signal for the next [`TraceFs::open_pipe`].
    ///
    /// # Errors
    /// Fails if the signal cannot be created.
    fn arm_pipe(&self) -> io::Result<()>;

    /// Open `trace_pipe` as a byte stream.
    ///
    /// # Errors
    /// Fails if the pipe cannot be opened.
    fn open_pipe(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Make pipes opened since the last [`TraceFs::arm_pipe`] report
    /// end-of-stream, including ones opened after this call.
    fn close_pipe(&self);
}

/// A tracefs mount
pub struct TraceFsDir {
    root: PathBuf,
    #[cfg(target_os = "linux")]
    stop: std::sync::Mutex<Option<Arc<ShutdownSignal>>>,
}

impl TraceFsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            #[cfg(target_os = "linux")]
            stop: std::sync::Mutex::new(None),
        }
    }

    /// Find the tracefs mount under [`TRACEFS_ROOTS`].
    ///
    /// # Errors
    /// Returns [`SysTraceError::TraceFsNotFound`] when neither location is mounted.
    pub fn detect() -> Result<Self, SysTraceError> {
        detect_root(TRACEFS_ROOTS.iter().map(Path::new))
            .map(Self::new)
            .ok_or(SysTraceError::TraceFsNotFound)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// First candidate that looks like a mounted tracefs.
pub fn detect_root<'a>(candidates: impl IntoIterator<Item = &'a Path>) -> Option<PathBuf> {
    candidates.into_iter().find(|root| root.join("tracing_on").exists()).map(Path::to_path_buf)
}

impl TraceFs for TraceFsDir {
    fn write(&self, file: &str, value: &str) -> Result<(), SysTraceError> {
        let path = self.root.join(file);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|mut f| f.write_all(value.as_bytes()))
            .map_err(|source| SysTraceError::TraceFsWrite { path, value: value.to_string(), source })
    }

    #[cfg(target_os = "linux")]
    fn arm_pipe(&self) -> io::Result<()> {
        let signal = Arc::new(ShutdownSignal::new()?);
        *self.stop.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(signal);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn arm_pipe(&self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn open_pipe(&self) -> io::Result<Box<dyn Read + Send>> {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "trace pipe not armed"))?;
        let file = OpenOptions::new().read(true).open(self.root.join(TRACE_PIPE))?;
        Ok(Box::new(TracePipeReader { file, stop }))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_pipe(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(OpenOptions::new().read(true).open(self.root.join(TRACE_PIPE))?))
    }

    fn close_pipe(&self) {
        #[cfg(target_os = "linux")]
        if let Some(stop) = self.stop.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
            stop.signal();
        }
    }
}

#[cfg(target_os = "linux")]
use self::pipe::{ShutdownSignal, TracePipeReader};

#[cfg(target_os = "linux")]
mod pipe {
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Arc;

    /// eventfd that stays readable once signalled
    pub(super) struct ShutdownSignal {
        eventfd: OwnedFd,
    }

    impl ShutdownSignal {
        pub(super) fn new() -> io::Result<Self> {
            // SAFETY: eventfd has no pointer arguments.
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd was just returned by eventfd and is owned by nobody else.
            Ok(Self { eventfd: unsafe { OwnedFd::from_raw_fd(fd) } })
        }

        pub(super) fn signal(&self) {
            let val: u64 = 1;
            // SAFETY: writes 8 bytes from a live u64.
            let _ = unsafe {
                libc::write(self.eventfd.as_raw_fd(), std::ptr::from_ref(&val).cast::<libc::c_void>(), 8)
            };
        }
    }

    /// `trace_pipe` reader that returns end-of-stream once the signal fires
    pub(super) struct TracePipeReader {
        pub(super) file: File,
        pub(super) stop: Arc<ShutdownSignal>,
    }

    impl Read for TracePipeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut fds = [
                    libc::pollfd { fd: self.file.as_raw_fd(), events: libc::POLLIN, revents: 0 },
                    libc::pollfd { fd: self.stop.eventfd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
                ];
                // SAFETY: fds is a live array of two pollfd entries.
                let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                if fds[1].revents != 0 {
                    return Ok(0);
                }
                if fds[0].revents != 0 {
                    return self.file.read(buf);
                }
            }
        }
    }
}

// ============================================================================
// Collector
// ============================================================================

/// `sched_switch` / `sched_wakeup` collector over a [`TraceFs`]
pub struct FtraceCollector<F: TraceFs> {
    fs: F,
    clock: TraceClock,
    connection: Arc<dyn ConnectionStatus>,
    lifecycle: Lifecycle,
}

impl<F: TraceFs> FtraceCollector<F> {
    pub fn new(fs: F, clock: TraceClock, connection: Arc<dyn ConnectionStatus>) -> Self {
        Self { fs, clock, connection, lifecycle: Lifecycle::new() }
    }

    /// tracefs writes performed by start, in order.
    #[must_use]
    pub fn start_sequence(&self) -> Vec<(&'static str, &'static str)> {
        let mut steps = vec![
            ("tracing_on", "0"),
            ("current_tracer", "nop"),
            ("trace_options", "norecord-cmd"),
            ("trace_options", "norecord-tgid"),
            ("trace_options", "noirq-info"),
        ];
        if let Some(clock) = self.clock.option_value() {
            steps.push(("trace_clock", clock));
        }
        steps.extend([
            ("events/sched/sched_switch/enable", "1"),
            ("events/sched/sched_wakeup/enable", "1"),
            ("tracing_on", "1"),
        ]);
        steps
    }

    #[must_use]
    pub fn phase(&self) -> super::Phase {
        self.lifecycle.phase()
    }

    fn enable(&self) -> Result<(), SysTraceError> {
        self.fs.arm_pipe()?;
        for (file, value) in self.start_sequence() {
            debug!("tracefs: {file} <- {value}");
            self.fs.write(file, value)?;
        }
        Ok(())
    }
}

impl<F: TraceFs> SysTrace for FtraceCollector<F> {
    fn name(&self) -> &'static str {
        "ftrace"
    }

    fn try_start(&self) -> Result<(), SysTraceError> {
        self.lifecycle.begin_start()?;
        let result = self.enable();
        self.lifecycle.finish_start(result)
    }

    fn worker(&self, sink: &mut dyn EventSink) {
        let pipe = match self.fs.open_pipe() {
            Ok(pipe) => pipe,
            Err(e) => {
                warn!("Cannot open {TRACE_PIPE}: {e}");
                return;
            }
        };
        let mut reader = BufReader::with_capacity(PIPE_BUFFER_SIZE, pipe);
        let mut line = Vec::with_capacity(512);
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{TRACE_PIPE} read failed: {e}");
                    break;
                }
            }
            if !self.connection.is_connected() {
                continue;
            }
            if let Some(item) = parse_line(&line, self.clock) {
                sink.publish(item);
            }
        }
    }

    fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        if let Err(e) = self.fs.write("tracing_on", "0") {
            warn!("Failed to disable tracing: {e}");
        }
        self.fs.close_pipe();
        self.lifecycle.finish_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracepipe_common::{ContextSwitch, STATE_RUNNING, STATE_SLEEPING, STATE_UNKNOWN};

    const SWITCH: &[u8] = b"          <idle>-0       [003] d..2.  5000.123456: sched_switch: prev_comm=swapper/3 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=bash next_pid=200 next_prio=120\n";

    #[test]
    fn test_parse_switch_mono_raw() {
        let item = parse_line(SWITCH, TraceClock::MonoRaw).unwrap();
        assert_eq!(
            item,
            QueueItem::ContextSwitch(ContextSwitch {
                time: 5_000_123_456_000,
                old_thread: 0,
                new_thread: 200,
                cpu: 3,
                reason: REASON_UNKNOWN,
                state: STATE_RUNNING,
            })
        );
    }

    #[test]
    fn test_parse_switch_tsc() {
        let line = b"  3] 5000: sched_switch: prev_pid=100 prev_state=S ==> next_pid=200";
        let item = parse_line(line, TraceClock::Tsc).unwrap();
        assert_eq!(item, QueueItem::context_switch(5000, 100, 200, 3, REASON_UNKNOWN, STATE_SLEEPING));
    }

    #[test]
    fn test_parse_wakeup() {
        let line = b"  bash-200 [001] d.h3. 17.5: sched_wakeup: comm=worker pid=4242 prio=120 target_cpu=001";
        let item = parse_line(line, TraceClock::MonoRaw).unwrap();
        assert_eq!(item, QueueItem::thread_wakeup(17_500_000_000, 4242));
    }

    #[test]
    fn test_parse_cpu_skips_non_numeric_brackets() {
        let line = b"  kworker/u8:2]-77 [012] .... 10: sched_wakeup: pid=9";
        let QueueItem::ThreadWakeup(w) = parse_line(line, TraceClock::Tsc).unwrap() else {
            panic!("wrong kind")
        };
        assert_eq!(w.thread, 9);
        assert_eq!(parse_cpu(line).unwrap().0, CpuId(12));
    }

    #[test]
    fn test_parse_unknown_state_char() {
        let line = b"[0] 1: sched_switch: prev_pid=1 prev_state=+ next_pid=2";
        let QueueItem::ContextSwitch(cs) = parse_line(line, TraceClock::Tsc).unwrap() else {
            panic!("wrong kind")
        };
        assert_eq!(cs.state, STATE_UNKNOWN);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        let cases: [&[u8]; 7] = [
            b"",
            b"\n",
            b"no brackets at all: sched_switch: prev_pid=1 prev_state=S next_pid=2",
            b"[1] 5.0: sched_migrate_task: pid=3",
            b"[1] 5.0: sched_switch: prev_pid=1 prev_state=S",
            b"[1] 5.0: sched_wakeup: pid=abc",
            b"[1] x.0: sched_wakeup: pid=1",
        ];
        for line in cases {
            assert_eq!(parse_line(line, TraceClock::MonoRaw), None, "{}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn test_timestamp_fraction_scaling() {
        assert_eq!(parse_timestamp(b"1.5", TraceClock::MonoRaw), Some(1_500_000_000));
        assert_eq!(parse_timestamp(b"1.000000001", TraceClock::MonoRaw), Some(1_000_000_001));
        assert_eq!(parse_timestamp(b"1.0000000019", TraceClock::MonoRaw), Some(1_000_000_001));
        assert_eq!(parse_timestamp(b"42", TraceClock::MonoRaw), Some(42));
        assert_eq!(parse_timestamp(b"42.9", TraceClock::Tsc), Some(42));
    }

    #[test]
    fn test_start_sequence_clock_step() {
        let connection: Arc<dyn ConnectionStatus> = Arc::new(super::super::Connection::new(true));
        let collector = FtraceCollector::new(TraceFsDir::new("/nonexistent"), TraceClock::Tsc, Arc::clone(&connection));
        let steps = collector.start_sequence();
        assert_eq!(steps.len(), 9);
        assert_eq!(steps[5], ("trace_clock", "x86-tsc"));
        assert_eq!(steps[8], ("tracing_on", "1"));

        let collector = FtraceCollector::new(TraceFsDir::new("/nonexistent"), TraceClock::Default, connection);
        assert!(collector.start_sequence().iter().all(|(file, _)| *file != "trace_clock"));
    }

    #[test]
    fn test_detect_root_prefers_first_mounted() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("tracing_on"), "0").unwrap();
        assert_eq!(detect_root([first.path(), second.path()]), Some(second.path().to_path_buf()));

        std::fs::write(first.path().join("tracing_on"), "0").unwrap();
        assert_eq!(detect_root([first.path(), second.path()]), Some(first.path().to_path_buf()));
    }
}
