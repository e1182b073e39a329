//! System trace collectors
//!
//! A collector turns kernel scheduling telemetry into [`QueueItem`]s on its
//! own worker thread, which is just another producer on the publish queue.
//!
//! ```text
//!   start()  ──▶  spawn_worker()  ──▶  worker() blocks on the OS source
//!                                         │  ContextSwitch / ThreadWakeup
//!   stop()   ──▶  OS source ends   ──▶  worker() returns  ──▶  join
//! ```
//!
//! Backends:
//! - [`etw`]: Windows kernel logger, binary `CSwitch` / `ReadyThread` records
//! - [`ftrace`]: Linux `trace_pipe`, text `sched_switch` / `sched_wakeup` lines

pub mod etw;
pub mod ftrace;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{info, warn};
use tracepipe_common::QueueItem;

use crate::domain::SysTraceError;
use crate::queue::{PublishQueue, Token};

/// Destination for decoded records
///
/// The queue [`Token`] is the production sink; tests collect into a `Vec`.
pub trait EventSink {
    fn publish(&mut self, item: QueueItem);
}

impl EventSink for Token {
    fn publish(&mut self, item: QueueItem) {
        // A full ring drops the record; the queue counts it.
        let _ = Token::publish(self, item);
    }
}

impl EventSink for Vec<QueueItem> {
    fn publish(&mut self, item: QueueItem) {
        self.push(item);
    }
}

/// Whether a viewer currently wants events
pub trait ConnectionStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Connection flag toggled by the transport layer
#[derive(Debug, Default)]
pub struct Connection {
    connected: AtomicBool,
}

impl Connection {
    #[must_use]
    pub fn new(connected: bool) -> Self {
        Self { connected: AtomicBool::new(connected) }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl ConnectionStatus for Connection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Start / Worker / Stop contract shared by every backend
///
/// `worker` runs on a dedicated thread and returns only after `stop` has been
/// called (or the OS source ends). The owner joins that thread after `stop`.
pub trait SysTrace: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Acquire OS resources and begin capture.
    ///
    /// # Errors
    /// Any failure is returned after resources acquired by earlier steps are
    /// released.
    fn try_start(&self) -> Result<(), SysTraceError>;

    /// [`SysTrace::try_start`], logging the failure.
    fn start(&self) -> bool {
        match self.try_start() {
            Ok(()) => {
                info!("{} system tracing started", self.name());
                true
            }
            Err(e) if e.is_permission_denied() => {
                warn!("{} system tracing needs elevated privileges: {e}", self.name());
                false
            }
            Err(e) => {
                warn!("{} system tracing unavailable: {e}", self.name());
                false
            }
        }
    }

    /// Blocking capture loop publishing into `sink`.
    fn worker(&self, sink: &mut dyn EventSink);

    /// End capture and release OS resources. Safe to call more than once.
    fn stop(&self);
}

/// Collector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// `Idle -> Starting -> Running -> Stopping -> Idle` state machine
#[derive(Debug)]
pub(crate) struct Lifecycle {
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self { phase: Mutex::new(Phase::Idle) }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.lock()
    }

    pub(crate) fn begin_start(&self) -> Result<(), SysTraceError> {
        let mut phase = self.lock();
        if *phase != Phase::Idle {
            return Err(SysTraceError::AlreadyRunning);
        }
        *phase = Phase::Starting;
        Ok(())
    }

    /// Settle a start attempt: `Running` on success, back to `Idle` otherwise.
    pub(crate) fn finish_start<T>(&self, result: Result<T, SysTraceError>) -> Result<T, SysTraceError> {
        *self.lock() = if result.is_ok() { Phase::Running } else { Phase::Idle };
        result
    }

    /// Enter `Stopping`; false when there is nothing to stop.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut phase = self.lock();
        if *phase != Phase::Running {
            return false;
        }
        *phase = Phase::Stopping;
        true
    }

    pub(crate) fn finish_stop(&self) {
        *self.lock() = Phase::Idle;
    }
}

/// Run `collector.worker` on a named thread that publishes into `queue`.
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn_worker(collector: Arc<dyn SysTrace>, queue: PublishQueue) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(format!("tracepipe-{}", collector.name())).spawn(move || {
        let mut token = queue.acquire_token();
        collector.worker(&mut token);
        info!("{} worker exited", collector.name());
    })
}

/// Kernel telemetry source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Ftrace,
    Etw,
}

impl Backend {
    /// Backend native to the platform this binary was built for.
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Backend::Etw
        } else {
            Backend::Ftrace
        }
    }
}

/// Build the collector for `backend`.
///
/// # Errors
/// Returns [`SysTraceError::Unsupported`] for a backend this platform lacks,
/// and [`SysTraceError::TraceFsNotFound`] when no tracefs root is given or found.
pub fn build(
    backend: Backend,
    tracefs: Option<&std::path::Path>,
    clock: ftrace::TraceClock,
    connection: Arc<dyn ConnectionStatus>,
) -> Result<Arc<dyn SysTrace>, SysTraceError> {
    match backend {
        Backend::Ftrace => {
            let dir = match tracefs {
                Some(root) => ftrace::TraceFsDir::new(root),
                None => ftrace::TraceFsDir::detect()?,
            };
            Ok(Arc::new(ftrace::FtraceCollector::new(dir, clock, connection)))
        }
        #[cfg(windows)]
        Backend::Etw => {
            let api = etw::Win32Etw::new(clock == ftrace::TraceClock::Tsc);
            Ok(Arc::new(etw::EtwCollector::new(api, connection)))
        }
        #[cfg(not(windows))]
        Backend::Etw => Err(SysTraceError::Unsupported("etw")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.phase(), Phase::Idle);
        assert!(!lifecycle.begin_stop());

        lifecycle.begin_start().unwrap();
        assert_eq!(lifecycle.phase(), Phase::Starting);
        assert!(matches!(lifecycle.begin_start(), Err(SysTraceError::AlreadyRunning)));
        lifecycle.finish_start(Ok(())).unwrap();
        assert_eq!(lifecycle.phase(), Phase::Running);

        assert!(lifecycle.begin_stop());
        assert_eq!(lifecycle.phase(), Phase::Stopping);
        assert!(!lifecycle.begin_stop());
        lifecycle.finish_stop();
        assert_eq!(lifecycle.phase(), Phase::Idle);
    }

    #[test]
    fn test_failed_start_returns_to_idle() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start().unwrap();
        let result: Result<(), _> = lifecycle.finish_start(Err(SysTraceError::SessionStart(5)));
        assert!(result.is_err());
        assert_eq!(lifecycle.phase(), Phase::Idle);
        assert!(lifecycle.begin_start().is_ok());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_etw_unsupported_off_windows() {
        let connection: Arc<dyn ConnectionStatus> = Arc::new(Connection::new(true));
        let result = build(Backend::Etw, None, ftrace::TraceClock::Default, connection);
        assert!(matches!(result, Err(SysTraceError::Unsupported("etw"))));
    }

    #[test]
    fn test_connection_toggle() {
        let connection = Connection::new(false);
        assert!(!connection.is_connected());
        connection.set_connected(true);
        assert!(connection.is_connected());
    }
}
