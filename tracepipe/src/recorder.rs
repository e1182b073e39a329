//! Recording session orchestration
//!
//! Wires a system trace collector, its worker thread and the drain thread
//! together, and tears them down in order:
//!
//! 1. drain thread takes the queue consumer and writes the stream header
//! 2. collector `start()`; on failure the session records without it
//! 3. collector worker spawned as a producer
//! 4. `finish()`: `stop()`, join worker, shut down drain, join drain

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::drain::{DrainSummary, DrainWorker, FrameWriter, ShutdownHandle, DEFAULT_IDLE_SLEEP};
use crate::queue::{self, PublishQueue, QueueStats};
use crate::resolver::Resolver;
use crate::systrace::ftrace::TraceClock;
use crate::systrace::{self, Backend, Connection, ConnectionStatus, SysTrace};

/// Everything `tracepipe record` needs, independent of the CLI
#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub backend: Backend,
    pub output: PathBuf,
    /// Stop on its own after this long
    pub duration: Option<Duration>,
    /// tracefs root; probed when unset
    pub tracefs: Option<PathBuf>,
    pub clock: TraceClock,
    pub resolve_names: bool,
    /// Start disconnected; system events are skipped until connected
    pub on_demand: bool,
    pub idle_sleep: Duration,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            backend: Backend::platform_default(),
            output: PathBuf::from("trace.tpip"),
            duration: None,
            tracefs: None,
            clock: TraceClock::matching_runtime(),
            resolve_names: true,
            on_demand: false,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }
}

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    /// Whether the system trace collector ran
    pub system_trace: bool,
    pub drain: DrainSummary,
    pub queue: QueueStats,
}

type DrainHandle<W> = JoinHandle<io::Result<(DrainSummary, W)>>;

/// A running recording
pub struct Session<W: Write + Send + 'static> {
    queue: PublishQueue,
    connection: Arc<Connection>,
    collector: Option<(Arc<dyn SysTrace>, JoinHandle<()>)>,
    drain: DrainHandle<W>,
    drain_shutdown: ShutdownHandle,
}

impl Session<BufWriter<File>> {
    /// Record into `config.output` through the process-wide queue.
    ///
    /// # Errors
    /// Fails if the output cannot be created or the drain cannot start.
    pub fn start(config: &RecordConfig) -> Result<Self> {
        let file = File::create(&config.output)
            .with_context(|| format!("Failed to create {}", config.output.display()))?;
        Self::start_with(config, queue::global().clone(), BufWriter::new(file))
    }
}

impl<W: Write + Send + 'static> Session<W> {
    /// Record from `queue` into `out`.
    ///
    /// A collector that cannot start is logged and skipped.
    ///
    /// # Errors
    /// Fails if the queue already has a consumer, the stream header cannot be
    /// written, or the drain thread cannot be spawned.
    pub fn start_with(config: &RecordConfig, queue: PublishQueue, out: W) -> Result<Self> {
        let consumer = queue.consumer().context("Failed to take the publish queue consumer")?;
        let writer = FrameWriter::new(out).context("Failed to write stream header")?;
        let resolver = config.resolve_names.then(Resolver::platform_default);

        let drain = DrainWorker::new(consumer, writer, resolver).with_idle_sleep(config.idle_sleep);
        let drain_shutdown = drain.shutdown_handle();
        let drain = drain.spawn().context("Failed to spawn drain thread")?;

        let connection = Arc::new(Connection::new(!config.on_demand));
        let collector = start_collector(config, &queue, connection.clone());

        Ok(Self { queue, connection, collector, drain, drain_shutdown })
    }

    /// Flag the collectors consult before publishing.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn system_trace_active(&self) -> bool {
        self.collector.is_some()
    }

    /// Stop capture, flush everything already published and return the output.
    ///
    /// # Errors
    /// Fails if the drain thread panicked or could not write the stream.
    pub fn finish(self) -> Result<(RecordSummary, W)> {
        let system_trace = self.collector.is_some();
        if let Some((collector, worker)) = self.collector {
            collector.stop();
            if worker.join().is_err() {
                warn!("{} worker panicked", collector.name());
            }
        }

        self.drain_shutdown.shutdown();
        let (drain, out) = self
            .drain
            .join()
            .map_err(|_| anyhow!("drain thread panicked"))?
            .context("Failed to write trace stream")?;

        let summary = RecordSummary { system_trace, drain, queue: self.queue.stats() };
        info!("Recording finished: {summary:?}");
        Ok((summary, out))
    }
}

fn start_collector(
    config: &RecordConfig,
    queue: &PublishQueue,
    connection: Arc<Connection>,
) -> Option<(Arc<dyn SysTrace>, JoinHandle<()>)> {
    let status: Arc<dyn ConnectionStatus> = connection;
    let collector = match systrace::build(config.backend, config.tracefs.as_deref(), config.clock, status) {
        Ok(collector) => collector,
        Err(e) => {
            warn!("System tracing unavailable: {e}");
            return None;
        }
    };
    if !collector.start() {
        return None;
    }
    match systrace::spawn_worker(collector.clone(), queue.clone()) {
        Ok(worker) => Some((collector, worker)),
        Err(e) => {
            warn!("Failed to spawn {} worker: {e}", collector.name());
            collector.stop();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_collector() -> RecordConfig {
        RecordConfig {
            backend: Backend::Ftrace,
            tracefs: Some(PathBuf::from("/nonexistent/tracefs")),
            resolve_names: false,
            ..RecordConfig::default()
        }
    }

    #[test]
    fn test_session_survives_collector_failure() {
        let queue = PublishQueue::new(64);
        let session = Session::start_with(&config_without_collector(), queue.clone(), Vec::new()).unwrap();
        assert!(!session.system_trace_active());

        let mut token = queue.acquire_token();
        token.publish(tracepipe_common::QueueItem::zone_end(1));

        let (summary, bytes) = session.finish().unwrap();
        assert!(!summary.system_trace);
        assert_eq!(summary.drain.drained, 1);
        assert_eq!(summary.queue.published, 1);
        // header + marker + record
        assert!(bytes.len() > tracepipe_common::wire::HEADER_SIZE);
    }

    #[test]
    fn test_second_session_on_same_queue_rejected() {
        let queue = PublishQueue::new(8);
        let first = Session::start_with(&config_without_collector(), queue.clone(), Vec::new()).unwrap();
        assert!(Session::start_with(&config_without_collector(), queue.clone(), Vec::new()).is_err());
        first.finish().unwrap();
        // The consumer is released once the first session is done.
        let again = Session::start_with(&config_without_collector(), queue, Vec::new()).unwrap();
        again.finish().unwrap();
    }

    #[test]
    fn test_on_demand_starts_disconnected() {
        let config = RecordConfig { on_demand: true, ..config_without_collector() };
        let session = Session::start_with(&config, PublishQueue::new(8), Vec::new()).unwrap();
        assert!(!session.connection().is_connected());
        session.connection().set_connected(true);
        assert!(session.connection().is_connected());
        session.finish().unwrap();
    }
}
