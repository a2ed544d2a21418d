//! Optimistic mutations with guaranteed rollback
//!
//! Every transaction snapshots its slice before the local write. The
//! snapshot lives in an arena behind a move-only handle and is consumed
//! exactly once, by commit or by rollback.

mod manager;
mod slice;
mod snapshot;

pub use manager::{MutationEvent, OptimisticManager, Transaction};
pub use slice::Slice;
pub use snapshot::{SnapshotArena, SnapshotHandle, TxnId};
