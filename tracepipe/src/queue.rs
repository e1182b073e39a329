//! Lock-free publish queue (producers → drain)
//!
//! Every producer thread owns a private [`Token`] backed by its own
//! single-producer ring. Publishing touches only that ring: the record is
//! written into the slot at the producer's tail, then the tail index is
//! advanced with one `Release` store. The single [`Consumer`] acquire-loads
//! each tail, copies out every slot below it and release-stores the head to
//! hand the slots back.
//!
//! ```text
//!  producer A ──▶ [ring A] ─┐
//!  producer B ──▶ [ring B] ─┼──▶ Consumer::drain ──▶ drain thread
//!  collector  ──▶ [ring C] ─┘
//! ```
//!
//! The registry lock is only taken when a token is created or dropped, when
//! the consumer is taken, released or notices a new or retired producer, and
//! by [`PublishQueue::stats`]. When a ring is full the reservation is dropped
//! and counted instead of blocking.
//!
//! A retired ring is unregistered by the consumer after its final drain. With
//! no consumer attached there is nobody to deliver to, so the ring is freed as
//! soon as its token drops and its unread records are discarded.

#![allow(unsafe_code)] // slot cells shared between one producer and the consumer

use std::cell::{RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::debug;
use tracepipe_common::QueueItem;

use crate::domain::{QueueError, Tid};

/// Slots per producer ring used by [`global`]
pub const DEFAULT_RING_CAPACITY: usize = 1024;

struct Slot(UnsafeCell<MaybeUninit<QueueItem>>);

struct ProducerRing {
    thread: Tid,
    slots: Box<[Slot]>,
    mask: u64,
    /// Number of records published; written only by the producer
    tail: AtomicU64,
    /// Number of records consumed; written only by the consumer
    head: AtomicU64,
    dropped: AtomicU64,
    retired: AtomicBool,
}

// SAFETY: the producer writes a slot only while it lies outside [head, tail)
// and the consumer reads it only while it lies inside. The tail Release/Acquire
// pair orders each write before its read, and the head Release/Acquire pair
// orders each read before the slot is reused.
unsafe impl Sync for ProducerRing {}

impl ProducerRing {
    fn new(thread: Tid, capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity).map(|_| Slot(UnsafeCell::new(MaybeUninit::uninit()))).collect();
        Self {
            thread,
            slots,
            mask: capacity as u64 - 1,
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq & self.mask) as usize]
    }

    /// Retired and nothing left to read.
    fn is_finished(&self) -> bool {
        self.retired.load(Ordering::Acquire)
            && self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Acquire)
    }
}

struct Registry {
    rings: Mutex<Vec<Arc<ProducerRing>>>,
    generation: AtomicU64,
    consumer_taken: AtomicBool,
    capacity: usize,
    retired_published: AtomicU64,
    retired_dropped: AtomicU64,
}

impl Registry {
    fn lock_rings(&self) -> MutexGuard<'_, Vec<Arc<ProducerRing>>> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every ring `matches` selects from `rings`, folding its
    /// counters into the retired totals. Caller holds the registry lock.
    fn unregister(&self, rings: &mut Vec<Arc<ProducerRing>>, matches: impl Fn(&ProducerRing) -> bool) {
        let before = rings.len();
        rings.retain(|ring| {
            if !matches(&**ring) {
                return true;
            }
            self.retired_published.fetch_add(ring.tail.load(Ordering::Relaxed), Ordering::Relaxed);
            self.retired_dropped.fetch_add(ring.dropped.load(Ordering::Relaxed), Ordering::Relaxed);
            debug!("Unregistered retired producer {}", ring.thread);
            false
        });
        if rings.len() != before {
            self.generation.fetch_add(1, Ordering::Release);
        }
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Producers currently registered (live or not yet fully drained)
    pub producers: usize,
    /// Records committed into a ring
    pub published: u64,
    /// Records discarded because their producer's ring was full
    pub dropped: u64,
}

/// Multi-producer, single-consumer publish queue
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct PublishQueue {
    registry: Arc<Registry>,
}

impl PublishQueue {
    /// Create a queue whose producer rings hold `capacity` records each
    /// (rounded up to a power of two).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                rings: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                consumer_taken: AtomicBool::new(false),
                capacity,
                retired_published: AtomicU64::new(0),
                retired_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register the calling thread as a producer.
    ///
    /// Call once per thread; the token must stay on this thread.
    #[must_use]
    pub fn acquire_token(&self) -> Token {
        let thread = Tid::current();
        let ring = Arc::new(ProducerRing::new(thread, self.registry.capacity));
        {
            let mut rings = self.registry.lock_rings();
            rings.push(Arc::clone(&ring));
            self.registry.generation.fetch_add(1, Ordering::Release);
        }
        debug!("Registered producer {thread}");
        Token { ring, registry: Arc::clone(&self.registry), _not_send: PhantomData }
    }

    /// Take the single consumer end.
    ///
    /// # Errors
    /// Returns [`QueueError::ConsumerTaken`] while another [`Consumer`] is alive.
    pub fn consumer(&self) -> Result<Consumer, QueueError> {
        let rings = self.registry.lock_rings();
        if self.registry.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(QueueError::ConsumerTaken);
        }
        Ok(Consumer {
            registry: Arc::clone(&self.registry),
            rings: rings.clone(),
            seen_generation: self.registry.generation.load(Ordering::Acquire),
        })
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let rings = self.registry.lock_rings();
        let mut stats = QueueStats {
            producers: rings.len(),
            published: self.registry.retired_published.load(Ordering::Relaxed),
            dropped: self.registry.retired_dropped.load(Ordering::Relaxed),
        };
        for ring in rings.iter() {
            stats.published += ring.tail.load(Ordering::Relaxed);
            stats.dropped += ring.dropped.load(Ordering::Relaxed);
        }
        stats
    }
}

/// A producer's private handle to its ring
///
/// Not `Send`: the tail is only ever advanced from the owning thread.
/// Dropping the token retires the ring; the consumer unregisters it once the
/// remaining records are drained, or right away when there is no consumer.
pub struct Token {
    ring: Arc<ProducerRing>,
    registry: Arc<Registry>,
    _not_send: PhantomData<*const ()>,
}

impl Token {
    /// Thread this token publishes for.
    #[must_use]
    pub fn thread(&self) -> Tid {
        self.ring.thread
    }

    /// Reserve the next slot of this producer's ring. Never blocks.
    ///
    /// When the consumer is a full ring behind the reservation is dropped:
    /// committing it discards the record.
    pub fn reserve(&mut self) -> Reservation<'_> {
        let ring = &*self.ring;
        let seq = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        let full = seq - head > ring.mask;
        Reservation { ring, seq, full }
    }

    /// Reserve and commit in one step.
    pub fn publish(&mut self, item: QueueItem) -> Option<u64> {
        self.reserve().commit(item)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.ring.retired.store(true, Ordering::Release);
        let mut rings = self.registry.lock_rings();
        if !self.registry.consumer_taken.load(Ordering::Acquire) {
            self.registry.unregister(&mut rings, |ring| std::ptr::eq(ring, &*self.ring));
        }
    }
}

/// A reserved slot, published by [`Reservation::commit`]
#[must_use = "nothing is published until the reservation is committed"]
pub struct Reservation<'a> {
    ring: &'a ProducerRing,
    seq: u64,
    full: bool,
}

impl Reservation<'_> {
    /// Position of this slot in the producer's publish sequence.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// True when the ring was full and the record will be discarded.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.full
    }

    /// Move `item` into the slot and publish it.
    ///
    /// Returns the publish sequence number, or `None` if the reservation was
    /// dropped.
    pub fn commit(self, item: QueueItem) -> Option<u64> {
        if self.full {
            self.ring.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // SAFETY: seq is outside [head, tail) so the consumer is not reading
        // this slot, and only this producer writes it.
        unsafe { (*self.ring.slot(self.seq).0.get()).write(item) };
        self.ring.tail.store(self.seq + 1, Ordering::Release);
        Some(self.seq)
    }
}

/// The single consumer end of a [`PublishQueue`]
pub struct Consumer {
    registry: Arc<Registry>,
    rings: Vec<Arc<ProducerRing>>,
    seen_generation: u64,
}

impl Consumer {
    /// Hand every record published so far to `f`, producer by producer.
    ///
    /// Records of one producer arrive in publish order. Returns the number of
    /// records drained.
    pub fn drain<F: FnMut(Tid, &QueueItem)>(&mut self, mut f: F) -> usize {
        self.refresh();

        let mut drained = 0usize;
        let mut saw_retired = false;
        for ring in &self.rings {
            // Retirement is stored after the final publish, so loading it
            // first guarantees the tail below is final when it is set.
            let retired = ring.retired.load(Ordering::Acquire);
            let tail = ring.tail.load(Ordering::Acquire);
            let head = ring.head.load(Ordering::Relaxed);
            for seq in head..tail {
                // SAFETY: seq is inside [head, tail); the producer will not
                // touch the slot until head moves past it.
                let item = unsafe { (*ring.slot(seq).0.get()).assume_init_read() };
                f(ring.thread, &item);
            }
            if tail != head {
                ring.head.store(tail, Ordering::Release);
                drained += usize::try_from(tail - head).unwrap_or(usize::MAX);
            }
            saw_retired |= retired;
        }

        if saw_retired {
            self.unregister_finished();
        }
        drained
    }

    /// Producers this consumer currently polls.
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.rings.len()
    }

    fn refresh(&mut self) {
        let generation = self.registry.generation.load(Ordering::Acquire);
        if generation != self.seen_generation {
            let rings = self.registry.lock_rings();
            self.rings.clone_from(&rings);
            self.seen_generation = generation;
        }
    }

    fn unregister_finished(&mut self) {
        let mut rings = self.registry.lock_rings();
        self.registry.unregister(&mut rings, ProducerRing::is_finished);
        self.rings.clone_from(&rings);
        self.seen_generation = self.registry.generation.load(Ordering::Acquire);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut rings = self.registry.lock_rings();
        self.registry.consumer_taken.store(false, Ordering::Release);
        // Tokens dropped while this consumer was attached left their rings
        // for it; nobody drains them any more.
        self.registry.unregister(&mut rings, |ring| ring.retired.load(Ordering::Acquire));
    }
}

/// Process-wide queue used by instrumentation and the collectors.
pub fn global() -> &'static PublishQueue {
    static GLOBAL: OnceLock<PublishQueue> = OnceLock::new();
    GLOBAL.get_or_init(|| PublishQueue::new(DEFAULT_RING_CAPACITY))
}

thread_local! {
    static THREAD_TOKEN: RefCell<Option<Token>> = const { RefCell::new(None) };
}

/// Run `f` with the calling thread's token on the [`global`] queue,
/// registering it on first use.
///
/// # Errors
/// Returns [`QueueError::ThreadExiting`] during thread-local destruction and
/// [`QueueError::Reentrant`] if called from inside `f`.
pub fn with_thread_token<R>(f: impl FnOnce(&mut Token) -> R) -> Result<R, QueueError> {
    THREAD_TOKEN
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().map_err(|_| QueueError::Reentrant)?;
            let token = slot.get_or_insert_with(|| global().acquire_token());
            Ok(f(token))
        })
        .map_err(|_| QueueError::ThreadExiting)?
}
