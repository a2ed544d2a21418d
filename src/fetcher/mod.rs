//! Per-key fetch coordination: freshness, deduplication and ordering

mod coordinator;
mod producer;

pub use coordinator::{FetchStats, Fetcher, Lookup, SharedFetch};
pub use producer::{producer, Producer, ProducerRef};
