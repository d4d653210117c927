//! Bounded, never-blocking queue for best-effort delivery
//!
//! Used by the arbiter fast-ack path: an ack for a higher sequence number
//! subsumes a lower one, so on overflow the queue keeps whichever of the
//! incoming and the oldest queued item is newer.

use crate::log::LogRecord;
use crate::vlsn::Vlsn;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Items carrying a sequence number
pub trait Sequenced {
    /// Sequence number used to pick the survivor on overflow
    fn vlsn(&self) -> Vlsn;
}

impl Sequenced for LogRecord {
    fn vlsn(&self) -> Vlsn {
        self.vlsn
    }
}

/// Outcome of [`BoundedReplaceQueue::offer`]
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    /// Queued without displacing anything
    Queued,
    /// Queued in place of this older item
    Superseded(T),
    /// Not queued; the item is handed back
    Dropped(T),
}

impl<T> Offer<T> {
    /// Whether the offered item ended up in the queue
    pub fn retained(&self) -> bool {
        !matches!(self, Self::Dropped(_))
    }
}

/// Fixed capacity FIFO with keep-the-newer replacement
pub struct BoundedReplaceQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
    full_offers: AtomicU64,
}

impl<T: Sequenced> BoundedReplaceQueue<T> {
    /// Queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            full_offers: AtomicU64::new(0),
        }
    }

    /// Queue `item` without blocking.
    ///
    /// When full, the oldest item gives way only to a newer one; the order
    /// of everything else is preserved.
    pub fn offer(&self, item: T) -> Offer<T> {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(item);
            drop(items);
            self.ready.notify_one();
            return Offer::Queued;
        }

        self.full_offers.fetch_add(1, Ordering::Relaxed);
        let oldest_vlsn = match items.front() {
            Some(oldest) => oldest.vlsn(),
            None => return Offer::Dropped(item),
        };
        if oldest_vlsn > item.vlsn() {
            debug!(
                "Overflow queue full, keeping {} over incoming {}",
                oldest_vlsn,
                item.vlsn()
            );
            return Offer::Dropped(item);
        }
        match items.pop_front() {
            Some(oldest) => {
                items.push_back(item);
                Offer::Superseded(oldest)
            }
            None => Offer::Dropped(item),
        }
    }

    /// Take the oldest item, waiting up to `wait`
    pub fn poll(&self, wait: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() && !wait.is_zero() {
            self.ready.wait_while_for(&mut items, |items| items.is_empty(), wait);
        }
        items.pop_front()
    }

    /// Queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Offers that found the queue at capacity, whichever item lost
    pub fn full_offers(&self) -> u64 {
        self.full_offers.load(Ordering::Relaxed)
    }

    /// Drop everything queued
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Commit records waiting to be sent to an arbiter
pub struct ArbiterFeed {
    queue: BoundedReplaceQueue<LogRecord>,
}

impl ArbiterFeed {
    /// Feed holding at most `capacity` commits
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: BoundedReplaceQueue::new(capacity),
        }
    }

    /// Queue a commit that needs an arbiter ack; true if it was retained
    pub fn offer_commit(&self, record: LogRecord) -> bool {
        match self.queue.offer(record) {
            Offer::Queued => true,
            Offer::Superseded(old) => {
                debug!("Arbiter commit {} superseded", old.vlsn);
                true
            }
            Offer::Dropped(record) => {
                debug!("Arbiter commit {} dropped on overflow", record.vlsn);
                false
            }
        }
    }

    /// Next commit to send
    pub fn next(&self, wait: Duration) -> Option<LogRecord> {
        self.queue.poll(wait)
    }

    /// Offers that found the feed at capacity
    pub fn full_offers(&self) -> u64 {
        self.queue.full_offers()
    }

    /// Release every queued record
    pub fn clear(&self) {
        self.queue.clear();
    }
}
