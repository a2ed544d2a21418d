//! Keyed cache store for stale-while-revalidate data
//!
//! Provides:
//! - JSON values per string key with loading/revalidating/error state
//! - Ordered, synchronous subscriber notification with deferred
//!   reentrant writes
//! - Grace-period garbage collection of unsubscribed keys

mod entry;
mod store;

pub use entry::CacheEntry;
pub use store::{run_gc_task, CacheStats, CacheStore, Subscription, SubscriberId};
