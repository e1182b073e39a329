//! Drain thread: the single consumer of the publish queue
//!
//! Pulls every visible record out of the queue, producer by producer, and
//! writes it to the outgoing stream. A [`ThreadContext`] marker goes out
//! whenever the producer changes. Scheduling records trigger a one-time name
//! lookup for each thread id the drain has not seen before.
//!
//! [`ThreadContext`]: tracepipe_common::ThreadContext

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};
use tracepipe_common::wire::{self, StreamHeader, MAX_RECORD_SIZE};
use tracepipe_common::{NameKind, QueueItem};

use crate::domain::Tid;
use crate::queue::Consumer;
use crate::resolver::{NameSink, Resolver};

/// Sleep between polls when a drain pass found nothing
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

// ============================================================================
// Outgoing Stream
// ============================================================================

/// Writes the stream header, then one encoded record per call
pub struct FrameWriter<W: Write> {
    out: W,
    records: u64,
    /// First failure seen through [`NameSink`], which cannot return errors
    deferred: Option<io::Error>,
}

impl<W: Write> FrameWriter<W> {
    /// Write the stream header to `out`.
    ///
    /// # Errors
    /// Returns the error of the header write.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(&StreamHeader::default().encode())?;
        Ok(Self { out, records: 0, deferred: None })
    }

    /// Encode and write one record.
    ///
    /// # Errors
    /// Returns the write error, or an earlier one deferred from [`NameSink`].
    pub fn write(&mut self, item: &QueueItem) -> io::Result<()> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let len = wire::encode(item, &mut buf).map_err(io::Error::other)?;
        self.out.write_all(&buf[..len])?;
        self.records += 1;
        Ok(())
    }

    /// # Errors
    /// Returns the flush error, or an earlier deferred one.
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        self.out.flush()
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> NameSink for FrameWriter<W> {
    fn send_name(&mut self, subject: u64, kind: NameKind, text: &str) {
        if self.deferred.is_some() {
            return;
        }
        if let Err(e) = self.write(&QueueItem::external_name(subject, kind, text)) {
            self.deferred = Some(e);
        }
    }
}

// ============================================================================
// Drain Worker
// ============================================================================

/// Counters reported when the drain exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Records taken from the queue
    pub drained: u64,
    /// Records written, including markers and names
    pub written: u64,
    /// Threads whose names were looked up
    pub names_resolved: u64,
}

/// Cloneable stop flag for a running [`DrainWorker`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Ask the drain to finish after one last pass.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The consumer loop
pub struct DrainWorker<W: Write> {
    consumer: Consumer,
    writer: FrameWriter<W>,
    resolver: Option<Resolver>,
    shutdown: ShutdownHandle,
    idle_sleep: Duration,
    current: Option<Tid>,
    named: HashSet<Tid>,
    summary: DrainSummary,
}

impl<W: Write> DrainWorker<W> {
    pub fn new(consumer: Consumer, writer: FrameWriter<W>, resolver: Option<Resolver>) -> Self {
        Self {
            consumer,
            writer,
            resolver,
            shutdown: ShutdownHandle::default(),
            idle_sleep: DEFAULT_IDLE_SLEEP,
            current: None,
            named: HashSet::new(),
            summary: DrainSummary::default(),
        }
    }

    #[must_use]
    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// One pass over every producer; returns the number of records drained.
    ///
    /// # Errors
    /// Returns the first write error of the pass.
    pub fn drain_once(&mut self) -> io::Result<usize> {
        let Self { consumer, writer, resolver, current, named, summary, .. } = self;
        let mut result = Ok(());

        let drained = consumer.drain(|producer, item| {
            if result.is_err() {
                return;
            }
            result = forward(writer, resolver.as_ref(), current, named, summary, producer, item);
        });

        self.summary.drained += drained as u64;
        self.summary.written = self.writer.records_written();
        result.map(|()| drained)
    }

    /// Drain until shut down, then drain once more and flush.
    ///
    /// # Errors
    /// Returns the first write or flush error; the loop stops at that point.
    pub fn run(mut self) -> io::Result<(DrainSummary, W)> {
        info!("Drain started");
        while !self.shutdown.is_shutdown() {
            if self.drain_once()? == 0 {
                thread::sleep(self.idle_sleep);
            }
        }
        self.drain_once()?;
        self.writer.flush()?;
        info!(
            "Drain finished: {} drained, {} written, {} threads named",
            self.summary.drained, self.summary.written, self.summary.names_resolved
        );
        Ok((self.summary, self.writer.into_inner()))
    }
}

impl<W: Write + Send + 'static> DrainWorker<W> {
    /// Run the drain on a dedicated named thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<(DrainSummary, W)>>> {
        thread::Builder::new().name("tracepipe-drain".to_string()).spawn(move || self.run())
    }
}

fn forward<W: Write>(
    writer: &mut FrameWriter<W>,
    resolver: Option<&Resolver>,
    current: &mut Option<Tid>,
    named: &mut HashSet<Tid>,
    summary: &mut DrainSummary,
    producer: Tid,
    item: &QueueItem,
) -> io::Result<()> {
    if *current != Some(producer) {
        writer.write(&QueueItem::thread_context(producer.as_record()))?;
        *current = Some(producer);
    }
    writer.write(item)?;

    let Some(resolver) = resolver else {
        return Ok(());
    };
    let threads = match item {
        QueueItem::ContextSwitch(cs) => [Some(cs.old_thread), Some(cs.new_thread)],
        QueueItem::ThreadWakeup(w) => [Some(w.thread), None],
        _ => return Ok(()),
    };
    for tid in threads.into_iter().flatten().map(Tid::from_record) {
        if named.insert(tid) {
            debug!("First sight of {tid}");
            resolver.resolve(tid, writer);
            summary.names_resolved += 1;
        }
    }
    writer.flush_deferred()
}

impl<W: Write> FrameWriter<W> {
    /// Surface an error deferred by [`NameSink::send_name`].
    fn flush_deferred(&mut self) -> io::Result<()> {
        self.deferred.take().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use crate::queue::PublishQueue;
    use crate::resolver::NameSource;

    struct NoNames;

    impl NameSource for NoNames {
        fn system_process(&self) -> (Pid, &'static str) {
            (Pid(0), "swapper")
        }
        fn owning_process(&self, _: Tid) -> Option<Pid> {
            None
        }
        fn thread_name(&self, _: Tid) -> Option<String> {
            None
        }
        fn thread_name_fallback(&self, _: Tid, _: Option<Pid>) -> Option<String> {
            None
        }
        fn process_image(&self, _: Pid) -> Option<String> {
            None
        }
    }

    fn decode_all(bytes: &[u8]) -> Vec<QueueItem> {
        StreamHeader::decode(bytes).unwrap();
        let mut offset = wire::HEADER_SIZE;
        let mut items = Vec::new();
        while offset < bytes.len() {
            let (item, used) = wire::decode(&bytes[offset..]).unwrap();
            items.push(item);
            offset += used;
        }
        items
    }

    #[test]
    fn test_context_marker_and_names_once() {
        let queue = PublishQueue::new(64);
        let consumer = queue.consumer().unwrap();
        let mut token = queue.acquire_token();
        token.publish(QueueItem::context_switch(1, 10, 20, 0, 100, 104));
        token.publish(QueueItem::thread_wakeup(2, 10));

        let writer = FrameWriter::new(Vec::new()).unwrap();
        let mut drain = DrainWorker::new(consumer, writer, Some(Resolver::new(NoNames)));
        assert_eq!(drain.drain_once().unwrap(), 2);
        assert_eq!(drain.drain_once().unwrap(), 0);

        let handle = drain.shutdown_handle();
        handle.shutdown();
        let (summary, bytes) = drain.run().unwrap();
        assert_eq!(summary.drained, 2);
        assert_eq!(summary.names_resolved, 2);

        let items = decode_all(&bytes);
        // marker, switch, 2 names for 10, 2 names for 20, wakeup
        assert_eq!(items.len(), 7);
        assert_eq!(items[0], QueueItem::thread_context(Tid::current().as_record()));
        assert_eq!(items[1].kind(), tracepipe_common::QueueType::ContextSwitch);
        assert!(items[2..6].iter().all(|i| matches!(i, QueueItem::ExternalName(n) if n.text.as_str() == "???")));
        assert_eq!(items[6], QueueItem::thread_wakeup(2, 10));
        assert_eq!(summary.written, 7);
    }

    #[test]
    fn test_marker_on_producer_change() {
        let queue = PublishQueue::new(64);
        let consumer = queue.consumer().unwrap();

        let mut token = queue.acquire_token();
        token.publish(QueueItem::zone_begin(1, 7));
        let other = queue.clone();
        let other_tid = thread::spawn(move || {
            let mut token = other.acquire_token();
            token.publish(QueueItem::zone_end(2));
            token.thread()
        })
        .join()
        .unwrap();

        let mut drain = DrainWorker::new(consumer, FrameWriter::new(Vec::new()).unwrap(), None);
        drain.drain_once().unwrap();
        drain.shutdown_handle().shutdown();
        let (_, bytes) = drain.run().unwrap();

        let markers: Vec<_> = decode_all(&bytes)
            .into_iter()
            .filter_map(|item| match item {
                QueueItem::ThreadContext(c) => Some(Tid::from_record(c.thread)),
                _ => None,
            })
            .collect();
        assert_eq!(markers, vec![Tid::current(), other_tid]);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "viewer went away"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_header_write_failure() {
        assert!(FrameWriter::new(FailingWriter).is_err());
    }
}
