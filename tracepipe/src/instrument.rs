//! Instrumentation call sites
//!
//! Every helper takes the calling thread's token on the [`global`] queue,
//! reserves a slot, fills it with a fully built record and publishes it.
//! Nothing here blocks or allocates once the token exists; a full ring or a
//! thread that is already tearing down loses the event.
//!
//! ```ignore
//! let _zone = tracepipe::instrument::zone(SRCLOC_PARSE);
//! tracepipe::instrument::plot(PLOT_QUEUE_DEPTH, depth as f64);
//! ```
//!
//! [`global`]: crate::queue::global

use tracepipe_common::QueueItem;

use crate::clock;
use crate::queue::with_thread_token;

/// Publish `build(now)` from the calling thread. Returns whether it was queued.
fn emit(build: impl FnOnce(i64) -> QueueItem) -> bool {
    with_thread_token(|token| token.reserve().commit(build(clock::now())).is_some()).unwrap_or(false)
}

/// Open a zone described by the source location id `srcloc`.
pub fn zone_begin(srcloc: u64) -> bool {
    emit(|time| QueueItem::zone_begin(time, srcloc))
}

/// Close the innermost open zone of this thread.
pub fn zone_end() -> bool {
    emit(QueueItem::zone_end)
}

/// Log `text`, cut to the record's inline capacity.
pub fn message(text: &str) -> bool {
    emit(|time| QueueItem::message(time, text))
}

pub fn plot(name: u64, value: f64) -> bool {
    emit(|time| QueueItem::plot(time, name, value))
}

/// Zone closed when dropped
#[must_use = "the zone ends as soon as the guard is dropped"]
pub struct Zone {
    _not_send: std::marker::PhantomData<*const ()>,
}

/// Open a zone for the rest of the enclosing scope.
pub fn zone(srcloc: u64) -> Zone {
    zone_begin(srcloc);
    Zone { _not_send: std::marker::PhantomData }
}

impl Drop for Zone {
    fn drop(&mut self) {
        zone_end();
    }
}
