//! Windows ETW kernel logger backend
//!
//! The kernel logger delivers binary `Thread` class records. Two opcodes are
//! decoded:
//!
//! | opcode | record | payload fields used |
//! |---|---|---|
//! | 36 | `CSwitch` (24 bytes) | `new_tid u32 @0`, `old_tid u32 @4`, `wait_reason i8 @12`, `state i8 @14` |
//! | 50 | `ReadyThread` (8 bytes) | `tid u32 @0` |
//!
//! The OS calls sit behind [`EtwApi`]; [`Win32Etw`] is the real binding and
//! only exists on Windows. Session and consumer handles are owned by the
//! [`EtwCollector`] and released exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use tracepipe_common::QueueItem;

use super::{ConnectionStatus, EventSink, Lifecycle, Phase, SysTrace};
use crate::domain::SysTraceError;

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use win32::Win32Etw;

pub const CSWITCH_OPCODE: u8 = 36;
pub const READY_THREAD_OPCODE: u8 = 50;

const CSWITCH_SIZE: usize = 24;
const READY_THREAD_SIZE: usize = 8;

/// `ERROR_SUCCESS`
pub const STATUS_SUCCESS: u32 = 0;
/// `ERROR_WMI_INSTANCE_NOT_FOUND`: no session to stop
pub const STATUS_INSTANCE_NOT_FOUND: u32 = 4201;

// ============================================================================
// Record Decoding
// ============================================================================

/// The parts of an `EVENT_RECORD` the decoder needs
#[derive(Debug, Clone, Copy)]
pub struct EtwRecord<'a> {
    pub opcode: u8,
    /// Raw header timestamp
    pub timestamp: i64,
    /// Buffer context processor number
    pub processor: u8,
    pub user_data: &'a [u8],
}

/// Decode a kernel logger record; `None` for other opcodes and short payloads.
#[must_use]
pub fn decode_record(record: &EtwRecord<'_>) -> Option<QueueItem> {
    match record.opcode {
        CSWITCH_OPCODE => {
            let data = record.user_data.get(..CSWITCH_SIZE)?;
            let new_tid = read_u32(data, 0)?;
            let old_tid = read_u32(data, 4)?;
            Some(QueueItem::context_switch(
                record.timestamp,
                old_tid,
                new_tid,
                record.processor,
                data[12],
                data[14],
            ))
        }
        READY_THREAD_OPCODE => {
            let data = record.user_data.get(..READY_THREAD_SIZE)?;
            Some(QueueItem::thread_wakeup(record.timestamp, read_u32(data, 0)?))
        }
        _ => None,
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().ok()?))
}

// ============================================================================
// OS Binding
// ============================================================================

/// Kernel logger control session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(pub u64);

/// Real-time consumer of the kernel logger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerHandle(pub u64);

/// ETW calls the collector makes; errors are raw Win32 status codes
pub trait EtwApi: Send + Sync {
    /// Enable `SeSystemProfilePrivilege` for this process.
    ///
    /// # Errors
    /// Status of the failing privilege call.
    fn enable_profile_privilege(&self) -> Result<(), u32>;

    /// Stop any kernel logger session left running; returns the raw status.
    fn stop_stale_session(&self) -> u32;

    /// Start the kernel logger in real-time mode with context-switch and
    /// dispatcher events.
    ///
    /// # Errors
    /// Status returned by the session start.
    fn start_session(&self) -> Result<SessionHandle, u32>;

    /// Open a real-time consumer with raw timestamps.
    ///
    /// # Errors
    /// Status of the failed open.
    fn open_consumer(&self) -> Result<ConsumerHandle, u32>;

    /// Dispatch records to `on_record` until the consumer is closed.
    ///
    /// # Errors
    /// Status the dispatch loop ended with.
    fn process(&self, consumer: ConsumerHandle, on_record: &mut dyn FnMut(&EtwRecord<'_>)) -> Result<(), u32>;

    fn close_consumer(&self, consumer: ConsumerHandle);

    fn stop_session(&self, session: SessionHandle);
}

// ============================================================================
// Collector
// ============================================================================

#[derive(Debug, Default)]
struct Handles {
    session: Option<SessionHandle>,
    consumer: Option<ConsumerHandle>,
}

/// Context switch and wakeup collector over an [`EtwApi`]
pub struct EtwCollector<A: EtwApi> {
    api: A,
    connection: Arc<dyn ConnectionStatus>,
    lifecycle: Lifecycle,
    handles: Mutex<Handles>,
}

impl<A: EtwApi> EtwCollector<A> {
    pub fn new(api: A, connection: Arc<dyn ConnectionStatus>) -> Self {
        Self { api, connection, lifecycle: Lifecycle::new(), handles: Mutex::new(Handles::default()) }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Access the OS binding (used by tests to inspect fakes).
    pub fn api(&self) -> &A {
        &self.api
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<(), SysTraceError> {
        self.api.enable_profile_privilege().map_err(SysTraceError::PrivilegeDenied)?;

        let status = self.api.stop_stale_session();
        if status != STATUS_SUCCESS && status != STATUS_INSTANCE_NOT_FOUND {
            return Err(SysTraceError::StaleSession(status));
        }

        let session = self.api.start_session().map_err(SysTraceError::SessionStart)?;
        let consumer = match self.api.open_consumer() {
            Ok(consumer) => consumer,
            Err(status) => {
                self.api.stop_session(session);
                return Err(SysTraceError::ConsumerOpen(status));
            }
        };

        let mut handles = self.handles();
        handles.session = Some(session);
        handles.consumer = Some(consumer);
        Ok(())
    }
}

impl<A: EtwApi> SysTrace for EtwCollector<A> {
    fn name(&self) -> &'static str {
        "etw"
    }

    fn try_start(&self) -> Result<(), SysTraceError> {
        self.lifecycle.begin_start()?;
        let result = self.open();
        self.lifecycle.finish_start(result)
    }

    fn worker(&self, sink: &mut dyn EventSink) {
        let Some(consumer) = self.handles().consumer else {
            debug!("ETW worker started without an open consumer");
            return;
        };
        let connection = &self.connection;
        let result = self.api.process(consumer, &mut |record: &EtwRecord<'_>| {
            if !connection.is_connected() {
                return;
            }
            if let Some(item) = decode_record(record) {
                sink.publish(item);
            }
        });
        if let Err(status) = result {
            debug!("ETW dispatch loop ended with status {status}");
        }
    }

    fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        let (consumer, session) = {
            let mut handles = self.handles();
            (handles.consumer.take(), handles.session.take())
        };
        if let Some(consumer) = consumer {
            self.api.close_consumer(consumer);
        }
        match session {
            Some(session) => self.api.stop_session(session),
            None => warn!("ETW stop without a session handle"),
        }
        self.lifecycle.finish_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systrace::Connection;
    use tracepipe_common::{ContextSwitch, ThreadWakeup};

    fn cswitch_payload(new_tid: u32, old_tid: u32, reason: u8, state: u8) -> [u8; CSWITCH_SIZE] {
        let mut data = [0u8; CSWITCH_SIZE];
        data[0..4].copy_from_slice(&new_tid.to_le_bytes());
        data[4..8].copy_from_slice(&old_tid.to_le_bytes());
        data[12] = reason;
        data[14] = state;
        data
    }

    #[test]
    fn test_decode_cswitch() {
        let payload = cswitch_payload(200, 100, 7, 5);
        let record = EtwRecord { opcode: CSWITCH_OPCODE, timestamp: 5000, processor: 3, user_data: &payload };
        assert_eq!(
            decode_record(&record),
            Some(QueueItem::ContextSwitch(ContextSwitch {
                time: 5000,
                old_thread: 100,
                new_thread: 200,
                cpu: 3,
                reason: 7,
                state: 5,
            }))
        );
    }

    #[test]
    fn test_decode_ready_thread() {
        let payload = [0x39, 0x30, 0, 0, 1, 2, 3, 0];
        let record = EtwRecord { opcode: READY_THREAD_OPCODE, timestamp: -4, processor: 0, user_data: &payload };
        assert_eq!(
            decode_record(&record),
            Some(QueueItem::ThreadWakeup(ThreadWakeup { time: -4, thread: 12345 }))
        );
    }

    #[test]
    fn test_decode_ignores_short_and_unknown() {
        let payload = cswitch_payload(1, 2, 0, 0);
        let short = EtwRecord { opcode: CSWITCH_OPCODE, timestamp: 0, processor: 0, user_data: &payload[..23] };
        assert_eq!(decode_record(&short), None);

        let short_ready = EtwRecord { opcode: READY_THREAD_OPCODE, timestamp: 0, processor: 0, user_data: &payload[..4] };
        assert_eq!(decode_record(&short_ready), None);

        let other = EtwRecord { opcode: 1, timestamp: 0, processor: 0, user_data: &payload };
        assert_eq!(decode_record(&other), None);
    }

    /// Fake binding failing at a chosen step and logging every call
    #[derive(Default)]
    struct ScriptedEtw {
        privilege: Option<u32>,
        stale_status: u32,
        start_error: Option<u32>,
        open_error: Option<u32>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedEtw {
        fn log(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EtwApi for ScriptedEtw {
        fn enable_profile_privilege(&self) -> Result<(), u32> {
            self.log("privilege");
            self.privilege.map_or(Ok(()), Err)
        }

        fn stop_stale_session(&self) -> u32 {
            self.log("stop_stale");
            self.stale_status
        }

        fn start_session(&self) -> Result<SessionHandle, u32> {
            self.log("start_session");
            self.start_error.map_or(Ok(SessionHandle(1)), Err)
        }

        fn open_consumer(&self) -> Result<ConsumerHandle, u32> {
            self.log("open_consumer");
            self.open_error.map_or(Ok(ConsumerHandle(2)), Err)
        }

        fn process(&self, _: ConsumerHandle, _: &mut dyn FnMut(&EtwRecord<'_>)) -> Result<(), u32> {
            self.log("process");
            Ok(())
        }

        fn close_consumer(&self, _: ConsumerHandle) {
            self.log("close_consumer");
        }

        fn stop_session(&self, _: SessionHandle) {
            self.log("stop_session");
        }
    }

    fn collector(api: ScriptedEtw) -> EtwCollector<ScriptedEtw> {
        EtwCollector::new(api, Arc::new(Connection::new(true)))
    }

    #[test]
    fn test_start_and_stop_release_each_handle_once() {
        let etw = collector(ScriptedEtw { stale_status: STATUS_INSTANCE_NOT_FOUND, ..Default::default() });
        assert!(etw.start());
        assert_eq!(etw.phase(), Phase::Running);
        etw.stop();
        etw.stop();
        assert_eq!(etw.phase(), Phase::Idle);
        assert_eq!(
            etw.api().calls(),
            vec!["privilege", "stop_stale", "start_session", "open_consumer", "close_consumer", "stop_session"]
        );
    }

    #[test]
    fn test_privilege_failure_has_no_side_effects() {
        let etw = collector(ScriptedEtw { privilege: Some(1300), ..Default::default() });
        assert!(matches!(etw.try_start(), Err(SysTraceError::PrivilegeDenied(1300))));
        assert_eq!(etw.api().calls(), vec!["privilege"]);
        assert_eq!(etw.phase(), Phase::Idle);
    }

    #[test]
    fn test_stale_session_error_aborts() {
        let etw = collector(ScriptedEtw { stale_status: 5, ..Default::default() });
        assert!(matches!(etw.try_start(), Err(SysTraceError::StaleSession(5))));
        assert_eq!(etw.api().calls(), vec!["privilege", "stop_stale"]);
    }

    #[test]
    fn test_session_start_failure() {
        let etw = collector(ScriptedEtw { start_error: Some(183), ..Default::default() });
        assert!(!etw.start());
        assert_eq!(etw.api().calls(), vec!["privilege", "stop_stale", "start_session"]);
    }

    #[test]
    fn test_consumer_open_failure_stops_session() {
        let etw = collector(ScriptedEtw { open_error: Some(87), ..Default::default() });
        assert!(matches!(etw.try_start(), Err(SysTraceError::ConsumerOpen(87))));
        assert_eq!(
            etw.api().calls(),
            vec!["privilege", "stop_stale", "start_session", "open_consumer", "stop_session"]
        );
        etw.stop();
        assert_eq!(etw.api().calls().len(), 5);
    }

    #[test]
    fn test_worker_without_start_returns() {
        let etw = collector(ScriptedEtw::default());
        let mut sink: Vec<QueueItem> = Vec::new();
        etw.worker(&mut sink);
        assert!(sink.is_empty());
        assert!(etw.api().calls().is_empty());
    }
}
