//! Steady-state record supply: item cache, record source, overflow queue

pub mod cache;
pub mod queue;
pub mod source;

pub use cache::{CacheStats, CachedItemRef, LogItem, LogItemCache};
pub use queue::{ArbiterFeed, BoundedReplaceQueue, Offer, Sequenced};
pub use source::{DurabilityGate, DurableVlsn, FeedSource, FeedSourceStats};
