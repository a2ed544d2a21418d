//! Cache entry types

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::FetchError;

/// A cached entry with fetch state
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub data: Option<serde_json::Value>,
  /// Last producer error. Previous data is kept alongside it.
  pub error: Option<FetchError>,
  /// When `data` was last written (monotonic)
  pub fetched_at: Option<Instant>,
  /// Wall-clock time of the last data write
  pub updated_at: Option<DateTime<Utc>>,
  pub is_loading: bool,
  pub is_revalidating: bool,
}

impl CacheEntry {
  /// A fresh entry for a key nobody has fetched yet.
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      data: None,
      error: None,
      fetched_at: None,
      updated_at: None,
      is_loading: true,
      is_revalidating: false,
    }
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  pub fn age(&self) -> Option<Duration> {
    self.fetched_at.map(|at| at.elapsed())
  }

  /// Data younger than `interval` is served without any network call.
  pub fn is_fresh(&self, interval: Duration) -> bool {
    self.age().map(|age| age < interval).unwrap_or(false)
  }

  pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, FetchError>> {
    self
      .data
      .as_ref()
      .map(|v| serde_json::from_value(v.clone()).map_err(FetchError::from))
  }
}
