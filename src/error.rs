//! Error taxonomy
//!
//! Every error produced inside a spawned task is converted into state
//! (cache error fields, connection state, notification events) at the
//! boundary where the task was started. These types are what ends up
//! in that state.

use thiserror::Error;

/// A producer (data-fetch function) rejected.
///
/// Cloneable because a single failure is fanned out to every caller
/// attached to the same in-flight fetch and stored on the cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("fetch failed: {0}")]
  Failed(String),
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },
  #[error("invalid payload: {0}")]
  Decode(String),
  #[error("fetch task was dropped before completing")]
  Cancelled,
}

impl FetchError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed(message.into())
  }
}

impl From<serde_json::Error> for FetchError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

/// The push channel failed to connect or dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("connection closed")]
  Closed,
  #[error("server error: {0}")]
  Server(String),
  #[error("malformed event: {0}")]
  Protocol(String),
}

/// An optimistic mutation's network call failed, or its bookkeeping did.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
  /// Network, validation and conflict failures are all treated the same
  /// at this layer: the mutation is rolled back.
  #[error("mutation rejected: {0}")]
  Rejected(String),
  #[error("no snapshot for transaction {0}")]
  SnapshotMissing(String),
  #[error("snapshot for transaction {0} holds a different state type")]
  SnapshotType(String),
}

impl MutationError {
  pub fn rejected(message: impl Into<String>) -> Self {
    Self::Rejected(message.into())
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_yaml::Error),
}

/// Umbrella error for callers that don't care which layer failed.
#[derive(Debug, Error)]
pub enum SwrError {
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error(transparent)]
  Channel(#[from] ChannelError),
  #[error(transparent)]
  Mutation(#[from] MutationError),
  #[error(transparent)]
  Config(#[from] ConfigError),
}
