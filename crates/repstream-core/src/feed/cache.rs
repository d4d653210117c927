//! Shared cache of recently written log items
//!
//! The log writer publishes each entry here so feeders streaming near the
//! tip of the log can skip the disk. Readers hold a [`CachedItemRef`] while
//! they use the bytes; the guard keeps a use count on the item that is
//! incremented once on acquisition and decremented once on drop.

use crate::log::EntryType;
use crate::vlsn::Vlsn;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// One cached log entry
#[derive(Debug)]
pub struct LogItem {
    /// Sequence number
    pub vlsn: Vlsn,
    /// Entry type
    pub entry_type: EntryType,
    /// Entry format version
    pub version: u8,
    /// Serialized entry
    pub payload: Bytes,
    /// Before-image, when tracked
    pub before_image: Option<Bytes>,
    use_count: AtomicU32,
    evicted: AtomicBool,
}

impl LogItem {
    /// New unreferenced item
    pub fn new(
        vlsn: Vlsn,
        entry_type: EntryType,
        version: u8,
        payload: Bytes,
        before_image: Option<Bytes>,
    ) -> Self {
        Self {
            vlsn,
            entry_type,
            version,
            payload,
            before_image,
            use_count: AtomicU32::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    /// Outstanding guards
    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Acquire)
    }

    /// Evicted from the cache and no longer referenced
    pub fn is_released(&self) -> bool {
        self.evicted.load(Ordering::Acquire) && self.use_count() == 0
    }
}

/// Use-counted handle to a [`LogItem`]
pub struct CachedItemRef {
    item: Arc<LogItem>,
}

impl CachedItemRef {
    fn acquire(item: Arc<LogItem>) -> Self {
        item.use_count.fetch_add(1, Ordering::AcqRel);
        Self { item }
    }

    /// The shared item, for inspecting its use count
    pub fn item(&self) -> &Arc<LogItem> {
        &self.item
    }
}

impl Deref for CachedItemRef {
    type Target = LogItem;

    fn deref(&self) -> &LogItem {
        &self.item
    }
}

impl Clone for CachedItemRef {
    fn clone(&self) -> Self {
        Self::acquire(self.item.clone())
    }
}

impl Drop for CachedItemRef {
    fn drop(&mut self) {
        self.item.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CachedItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedItemRef")
            .field("vlsn", &self.item.vlsn)
            .field("use_count", &self.item.use_count())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
    /// Items evicted
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded VLSN-keyed cache, evicting oldest insertions first
pub struct LogItemCache {
    capacity: usize,
    items: DashMap<Vlsn, Arc<LogItem>>,
    order: Mutex<VecDeque<Vlsn>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LogItemCache {
    /// Cache holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Publish an item, evicting the oldest beyond capacity
    pub fn insert(&self, item: LogItem) {
        let vlsn = item.vlsn;
        let mut order = self.order.lock();
        if let Some(old) = self.items.insert(vlsn, Arc::new(item)) {
            old.evicted.store(true, Ordering::Release);
        } else {
            order.push_back(vlsn);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                if let Some((_, evicted)) = self.items.remove(&oldest) {
                    evicted.evicted.store(true, Ordering::Release);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Acquire a guard on the item for `vlsn`
    pub fn get(&self, vlsn: Vlsn) -> Option<CachedItemRef> {
        match self.items.get(&vlsn) {
            Some(item) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CachedItemRef::acquire(item.value().clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Items currently cached
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every item
    pub fn clear(&self) {
        let mut order = self.order.lock();
        for (_, item) in order.drain(..).filter_map(|v| self.items.remove(&v)) {
            item.evicted.store(true, Ordering::Release);
        }
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(v: i64) -> LogItem {
        LogItem::new(
            Vlsn::new(v),
            EntryType::Data,
            16,
            Bytes::from(v.to_be_bytes().to_vec()),
            None,
        )
    }

    #[test]
    fn test_guard_counts_uses() {
        let cache = LogItemCache::new(4);
        cache.insert(item(1));

        let a = cache.get(Vlsn::new(1)).unwrap();
        let b = a.clone();
        assert_eq!(a.use_count(), 2);
        drop(a);
        assert_eq!(b.use_count(), 1);
        let shared = b.item().clone();
        drop(b);
        assert_eq!(shared.use_count(), 0);
    }

    #[test]
    fn test_eviction_keeps_held_bytes() {
        let cache = LogItemCache::new(2);
        cache.insert(item(1));
        let held = cache.get(Vlsn::new(1)).unwrap();
        cache.insert(item(2));
        cache.insert(item(3));

        assert!(cache.get(Vlsn::new(1)).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(&held.payload[..], &1i64.to_be_bytes());
        let shared = held.item().clone();
        assert!(!shared.is_released());
        drop(held);
        assert!(shared.is_released());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
