//! # Canonical Event Records (producers ↔ drain)
//!
//! Defines the records every producer publishes into the queue and the drain
//! thread forwards to the viewer. Records are plain `Copy` values with no heap
//! ownership, so a producer builds the complete value first and the queue
//! moves it into a slot in one step.
//!
//! ## Key Types
//!
//! - [`QueueItem`] - Tagged union of every producible event kind
//! - [`ContextSwitch`] / [`ThreadWakeup`] - Scheduler records from the system trace collectors
//! - [`ExternalName`] - One-shot thread/process label emitted by the name resolver
//! - [`ShortString`] - Inline fixed-capacity string used by text-carrying records
//!
//! The byte layout used outside the process lives in [`wire`].

#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod wire;

use core::fmt;

// ============================================================================
// Scheduler State Codes
// ============================================================================

/// Thread state was not captured or the OS state is not in the table.
///
/// Also used as the fixed `reason` by backends that cannot observe a wait reason.
pub const STATE_UNKNOWN: u8 = 100;

/// `D`: uninterruptible sleep (usually disk I/O)
pub const STATE_UNINTERRUPTIBLE: u8 = 101;

/// `I`: idle kernel thread
pub const STATE_IDLE: u8 = 102;

/// `R`: running or runnable (preempted)
pub const STATE_RUNNING: u8 = 103;

/// `S`: interruptible sleep
pub const STATE_SLEEPING: u8 = 104;

/// `T`: stopped by job control signal
pub const STATE_STOPPED: u8 = 105;

/// `t`: stopped by debugger during tracing
pub const STATE_TRACED: u8 = 106;

/// `W`: paging / waking
pub const STATE_PAGING: u8 = 107;

/// `X`: dead
pub const STATE_DEAD: u8 = 108;

/// `Z`: zombie
pub const STATE_ZOMBIE: u8 = 109;

/// Reason code used when the backend cannot recover why a thread was switched out.
pub const REASON_UNKNOWN: u8 = STATE_UNKNOWN;

/// Map an ftrace `prev_state` character to a canonical state code.
///
/// Every input maps to a code in `100..=109`; characters outside the table
/// map to [`STATE_UNKNOWN`].
#[must_use]
pub const fn state_from_ftrace(state: u8) -> u8 {
    match state {
        b'D' => STATE_UNINTERRUPTIBLE,
        b'I' => STATE_IDLE,
        b'R' => STATE_RUNNING,
        b'S' => STATE_SLEEPING,
        b'T' => STATE_STOPPED,
        b't' => STATE_TRACED,
        b'W' => STATE_PAGING,
        b'X' => STATE_DEAD,
        b'Z' => STATE_ZOMBIE,
        _ => STATE_UNKNOWN,
    }
}

// ============================================================================
// Inline Strings
// ============================================================================

/// Maximum number of UTF-8 bytes a [`ShortString`] holds.
pub const SHORT_STRING_CAPACITY: usize = 62;

/// Text placeholder meaning "resolution attempted and failed".
pub const UNRESOLVED_NAME: &str = "???";

/// Inline UTF-8 string with a fixed capacity of [`SHORT_STRING_CAPACITY`] bytes
///
/// Longer input is truncated on a character boundary, so the stored bytes are
/// always valid UTF-8.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortString {
    len: u8,
    bytes: [u8; SHORT_STRING_CAPACITY],
}

impl ShortString {
    /// Copy `text` into a new inline string, truncating if needed.
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(SHORT_STRING_CAPACITY);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; SHORT_STRING_CAPACITY];
        bytes[..end].copy_from_slice(&text.as_bytes()[..end]);
        #[allow(clippy::cast_possible_truncation)]
        let len = end as u8;
        Self { len, bytes }
    }

    /// The [`UNRESOLVED_NAME`] sentinel.
    #[must_use]
    pub fn unresolved() -> Self {
        Self::new(UNRESOLVED_NAME)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Construction only ever stores whole characters.
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ShortString {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for ShortString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ShortString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Record Kinds
// ============================================================================

/// Wire tag of each record kind
///
/// Values are part of the wire protocol; see [`wire::PROTOCOL_VERSION`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    ZoneBegin = 0,
    ZoneEnd = 1,
    Message = 2,
    PlotData = 3,
    ContextSwitch = 4,
    ThreadWakeup = 5,
    ExternalName = 6,
    ThreadContext = 7,
}

impl QueueType {
    /// Convert a raw tag byte back into a record kind.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::ZoneBegin,
            1 => Self::ZoneEnd,
            2 => Self::Message,
            3 => Self::PlotData,
            4 => Self::ContextSwitch,
            5 => Self::ThreadWakeup,
            6 => Self::ExternalName,
            7 => Self::ThreadContext,
            _ => return None,
        })
    }
}

/// Instrumented zone entered
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneBegin {
    /// Raw tick count from the runtime clock
    pub time: i64,
    /// Caller-defined source location identifier
    pub srcloc: u64,
}

/// Instrumented zone left
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneEnd {
    pub time: i64,
}

/// Free-form log message
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub time: i64,
    pub text: ShortString,
}

/// One sample of a named plot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotData {
    pub time: i64,
    /// Caller-defined plot identifier
    pub name: u64,
    pub value: f64,
}

/// CPU execution moved from one thread to another
///
/// Thread ids only populate the low 32 bits; the upper half is always zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    /// Raw timestamp as reported by the kernel trace source
    pub time: i64,
    /// Thread switched out
    pub old_thread: u64,
    /// Thread switched in
    pub new_thread: u64,
    pub cpu: u8,
    /// Wait reason of the old thread, or [`REASON_UNKNOWN`]
    pub reason: u8,
    /// State of the old thread (raw OS value below 100, or a canonical `STATE_*` code)
    pub state: u8,
}

/// A sleeping thread became runnable
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadWakeup {
    pub time: i64,
    pub thread: u64,
}

/// What an [`ExternalName`] labels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    ThreadName = 0,
    ProcessName = 1,
}

impl NameKind {
    #[must_use]
    pub const fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(Self::ThreadName),
            1 => Some(Self::ProcessName),
            _ => None,
        }
    }
}

/// Human-readable label for an OS thread id
///
/// `text` is [`UNRESOLVED_NAME`] when every lookup failed; the record is never omitted.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalName {
    /// OS thread id the label belongs to
    pub subject: u64,
    pub kind: NameKind,
    pub text: ShortString,
}

/// Marks the producer thread of the records that follow in the outgoing stream
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub thread: u64,
}

/// Every record kind a producer can publish
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueueItem {
    ZoneBegin(ZoneBegin) = QueueType::ZoneBegin as u8,
    ZoneEnd(ZoneEnd) = QueueType::ZoneEnd as u8,
    Message(Message) = QueueType::Message as u8,
    PlotData(PlotData) = QueueType::PlotData as u8,
    ContextSwitch(ContextSwitch) = QueueType::ContextSwitch as u8,
    ThreadWakeup(ThreadWakeup) = QueueType::ThreadWakeup as u8,
    ExternalName(ExternalName) = QueueType::ExternalName as u8,
    ThreadContext(ThreadContext) = QueueType::ThreadContext as u8,
}

impl QueueItem {
    #[must_use]
    pub const fn kind(&self) -> QueueType {
        match self {
            Self::ZoneBegin(_) => QueueType::ZoneBegin,
            Self::ZoneEnd(_) => QueueType::ZoneEnd,
            Self::Message(_) => QueueType::Message,
            Self::PlotData(_) => QueueType::PlotData,
            Self::ContextSwitch(_) => QueueType::ContextSwitch,
            Self::ThreadWakeup(_) => QueueType::ThreadWakeup,
            Self::ExternalName(_) => QueueType::ExternalName,
            Self::ThreadContext(_) => QueueType::ThreadContext,
        }
    }

    /// Timestamp of the record, if the kind carries one.
    #[must_use]
    pub const fn time(&self) -> Option<i64> {
        match self {
            Self::ZoneBegin(z) => Some(z.time),
            Self::ZoneEnd(z) => Some(z.time),
            Self::Message(m) => Some(m.time),
            Self::PlotData(p) => Some(p.time),
            Self::ContextSwitch(c) => Some(c.time),
            Self::ThreadWakeup(w) => Some(w.time),
            Self::ExternalName(_) | Self::ThreadContext(_) => None,
        }
    }

    #[must_use]
    pub const fn zone_begin(time: i64, srcloc: u64) -> Self {
        Self::ZoneBegin(ZoneBegin { time, srcloc })
    }

    #[must_use]
    pub const fn zone_end(time: i64) -> Self {
        Self::ZoneEnd(ZoneEnd { time })
    }

    #[must_use]
    pub fn message(time: i64, text: &str) -> Self {
        Self::Message(Message { time, text: ShortString::new(text) })
    }

    #[must_use]
    pub const fn plot(time: i64, name: u64, value: f64) -> Self {
        Self::PlotData(PlotData { time, name, value })
    }

    /// Build a context switch record; thread ids are zero-extended from 32 bits.
    #[must_use]
    pub const fn context_switch(
        time: i64,
        old_thread: u32,
        new_thread: u32,
        cpu: u8,
        reason: u8,
        state: u8,
    ) -> Self {
        Self::ContextSwitch(ContextSwitch {
            time,
            old_thread: old_thread as u64,
            new_thread: new_thread as u64,
            cpu,
            reason,
            state,
        })
    }

    /// Build a wakeup record; the thread id is zero-extended from 32 bits.
    #[must_use]
    pub const fn thread_wakeup(time: i64, thread: u32) -> Self {
        Self::ThreadWakeup(ThreadWakeup { time, thread: thread as u64 })
    }

    #[must_use]
    pub fn external_name(subject: u64, kind: NameKind, text: &str) -> Self {
        Self::ExternalName(ExternalName { subject, kind, text: ShortString::new(text) })
    }

    #[must_use]
    pub const fn thread_context(thread: u64) -> Self {
        Self::ThreadContext(ThreadContext { thread })
    }
}
