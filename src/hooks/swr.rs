use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;

use crate::cache::{CacheEntry, Subscription};
use crate::config::HookOptions;
use crate::error::FetchError;
use crate::fetcher::{Fetcher, Lookup, ProducerRef, SharedFetch};
use crate::triggers::{Registration, Triggers};

/// Typed view of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SwrState<T> {
  pub data: Option<T>,
  pub error: Option<FetchError>,
  pub is_loading: bool,
  pub is_revalidating: bool,
}

impl<T: DeserializeOwned> SwrState<T> {
  /// Decode the entry. Data that doesn't fit `T` shows up as a
  /// [`FetchError::Decode`] in `error`.
  pub fn from_entry(entry: &CacheEntry) -> Self {
    let (data, decode_error) = match entry.decode::<T>() {
      Some(Ok(data)) => (Some(data), None),
      Some(Err(e)) => (None, Some(e)),
      None => (None, None),
    };
    Self {
      data,
      error: decode_error.or_else(|| entry.error.clone()),
      is_loading: entry.is_loading,
      is_revalidating: entry.is_revalidating,
    }
  }
}

/// A consumer bound to one key.
///
/// Holds the store subscription and the trigger registration for the
/// key; dropping the handle releases both. An in-flight fetch keeps
/// running for whoever else is attached.
pub struct SwrHandle<T> {
  key: String,
  fetcher: Arc<Fetcher>,
  producer: ProducerRef,
  options: HookOptions,
  rx: watch::Receiver<CacheEntry>,
  _subscription: Subscription,
  _registration: Registration,
  _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SwrHandle<T> {
  pub fn new(
    fetcher: &Arc<Fetcher>,
    triggers: &Arc<Triggers>,
    key: &str,
    producer: ProducerRef,
    options: HookOptions,
  ) -> Self {
    // subscribe before requesting so the loading flag and the result are
    // both observed
    let (subscription, rx) = fetcher.store().subscribe_watch(key);
    let registration = triggers.register(key, producer.clone(), options);
    match fetcher.request(key, &producer, &options) {
      Lookup::Fresh(_) => tracing::trace!(key, "mounted on fresh entry"),
      Lookup::Stale(..) => tracing::trace!(key, "mounted on stale entry"),
      Lookup::Pending(_) => tracing::trace!(key, "mounted, waiting for first fetch"),
    }

    Self {
      key: key.to_string(),
      fetcher: fetcher.clone(),
      producer,
      options,
      rx,
      _subscription: subscription,
      _registration: registration,
      _marker: PhantomData,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn options(&self) -> &HookOptions {
    &self.options
  }

  /// Raw cache entry as last observed.
  pub fn entry(&self) -> CacheEntry {
    self.rx.borrow().clone()
  }

  pub fn state(&self) -> SwrState<T> {
    SwrState::from_entry(&self.rx.borrow())
  }

  /// Wait for the next write to the key. `None` once the entry has been
  /// removed from the store.
  pub async fn changed(&mut self) -> Option<SwrState<T>> {
    self.rx.changed().await.ok()?;
    Some(SwrState::from_entry(&self.rx.borrow_and_update()))
  }

  /// Wait until the key has settled with data or an error.
  pub async fn wait_for_data(&mut self) -> Result<T, FetchError> {
    loop {
      {
        let entry = self.rx.borrow_and_update();
        if !entry.is_loading {
          match entry.decode::<T>() {
            Some(result) => return result,
            None => {
              if let Some(e) = &entry.error {
                return Err(e.clone());
              }
            }
          }
        }
      }
      if self.rx.changed().await.is_err() {
        return Err(FetchError::Cancelled);
      }
    }
  }

  /// Manual refresh. Always runs the producer, ignoring the deduping
  /// interval.
  pub async fn refresh(&self) -> Result<T, FetchError> {
    let value = self.fetcher.refresh(&self.key, &self.producer).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Automatic-path revalidation; `None` while the entry is fresh.
  pub fn revalidate(&self) -> Option<SharedFetch> {
    self
      .fetcher
      .revalidate(&self.key, &self.producer, &self.options)
  }

  /// Write a value straight into the cache without a fetch.
  pub fn mutate_local(&self, value: &T) -> Result<(), FetchError>
  where
    T: Serialize,
  {
    let value = serde_json::to_value(value)?;
    self.fetcher.store().set(&self.key, value);
    Ok(())
  }
}

impl<T> std::fmt::Debug for SwrHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SwrHandle").field("key", &self.key).finish()
  }
}
