//! Stale-while-revalidate data cache with push updates and optimistic
//! mutations.
//!
//! - [`cache`]: keyed store with ordered subscriber notification
//! - [`fetcher`]: deduplicated, sequence-guarded producer runs
//! - [`triggers`]: focus, reconnect, interval and manual revalidation
//! - [`channel`]: real-time push channel with polling fallback
//! - [`mutation`]: optimistic updates with snapshot rollback
//! - [`hooks`]: typed consumer handles
//!
//! [`SwrClient`] wires these together around one shared store.

pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hooks;
pub mod mutation;
pub mod triggers;

pub use cache::{CacheEntry, CacheStore};
pub use client::SwrClient;
pub use config::{HookOptions, SwrConfig};
pub use error::{ChannelError, FetchError, MutationError, SwrError};
pub use fetcher::{producer, Fetcher, Producer, ProducerRef};
pub use hooks::{MetricsSocket, SwrHandle, SwrState};
pub use mutation::{OptimisticManager, Slice};
pub use triggers::LifecycleEvent;
