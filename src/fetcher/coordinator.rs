use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::producer::ProducerRef;
use crate::cache::{CacheEntry, CacheStore};
use crate::config::HookOptions;
use crate::error::FetchError;

/// A producer run that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, Result<serde_json::Value, FetchError>>>;

/// At most one of these lives per key.
struct FetchTask {
  seq: u64,
  started_at: Instant,
  future: SharedFetch,
}

/// Exists only while a fetch for the key is outstanding.
#[derive(Default)]
struct KeyState {
  /// Sequence number of the most recently issued request. Only the
  /// completion carrying this number may write the cache.
  seq: u64,
  inflight: Option<FetchTask>,
}

/// An in-flight slot claimed under the key map lock, not yet spawned.
struct Claim {
  seq: u64,
  future: SharedFetch,
  tx: oneshot::Sender<Result<serde_json::Value, FetchError>>,
}

/// What a consumer sees the moment it asks for a key.
pub enum Lookup {
  /// Cached and younger than the deduping interval; no network call.
  Fresh(CacheEntry),
  /// Cached but old; served as-is while a background fetch runs.
  Stale(CacheEntry, SharedFetch),
  /// Nothing cached yet; the caller has to wait.
  Pending(SharedFetch),
}

impl Lookup {
  pub fn entry(&self) -> Option<&CacheEntry> {
    match self {
      Lookup::Fresh(entry) | Lookup::Stale(entry, _) => Some(entry),
      Lookup::Pending(_) => None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
  /// Producer invocations
  pub runs: u64,
  /// Callers that attached to an already running fetch
  pub deduplicated: u64,
  /// Completions dropped because a newer request was issued
  pub discarded: u64,
}

/// Decides whether a producer runs and keeps the store's loading and
/// revalidating flags in step with it.
pub struct Fetcher {
  store: Arc<CacheStore>,
  keys: Mutex<HashMap<String, KeyState>>,
  /// Shared by all keys, so a pruned key never reissues an old number.
  next_seq: AtomicU64,
  runs: AtomicU64,
  deduplicated: AtomicU64,
  discarded: AtomicU64,
}

impl Fetcher {
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      keys: Mutex::new(HashMap::new()),
      next_seq: AtomicU64::new(0),
      runs: AtomicU64::new(0),
      deduplicated: AtomicU64::new(0),
      discarded: AtomicU64::new(0),
    }
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  /// Non-blocking lookup. Serves cached data immediately and starts (or
  /// joins) a fetch when the data is missing or stale.
  pub fn request(
    self: &Arc<Self>,
    key: &str,
    producer: &ProducerRef,
    options: &HookOptions,
  ) -> Lookup {
    match self.store.get(key) {
      Some(entry) if entry.has_data() && entry.is_fresh(options.deduping_interval()) => {
        tracing::debug!(key, "serving fresh cache entry");
        Lookup::Fresh(entry)
      }
      Some(entry) if entry.has_data() => {
        tracing::debug!(key, "serving stale cache entry, revalidating");
        let future = self.join_or_start(key, producer);
        Lookup::Stale(entry, future)
      }
      _ => Lookup::Pending(self.join_or_start(key, producer)),
    }
  }

  /// Read a key, waiting for the producer only when nothing is cached.
  pub async fn fetch(
    self: &Arc<Self>,
    key: &str,
    producer: &ProducerRef,
    options: &HookOptions,
  ) -> Result<serde_json::Value, FetchError> {
    match self.request(key, producer, options) {
      Lookup::Fresh(entry) | Lookup::Stale(entry, _) => entry.data.ok_or(FetchError::Cancelled),
      Lookup::Pending(future) => future.await,
    }
  }

  /// Automatic revalidation (focus, reconnect, interval). Skipped while
  /// the cached data is still fresh.
  pub fn revalidate(
    self: &Arc<Self>,
    key: &str,
    producer: &ProducerRef,
    options: &HookOptions,
  ) -> Option<SharedFetch> {
    if let Some(entry) = self.store.get(key) {
      if entry.is_fresh(options.deduping_interval()) {
        tracing::trace!(key, "revalidation skipped, entry is fresh");
        return None;
      }
    }
    Some(self.join_or_start(key, producer))
  }

  /// Manual refresh: always runs the producer. Any fetch already in
  /// flight for the key is superseded and its result discarded.
  pub fn refresh(self: &Arc<Self>, key: &str, producer: &ProducerRef) -> SharedFetch {
    let claim = {
      let mut keys = self.keys.lock();
      let state = keys.entry(key.to_string()).or_default();
      self.claim(key, state)
    };
    self.launch(key, claim, producer.clone())
  }

  /// Invalidate whatever is in flight for `key` without starting a new
  /// fetch. Used when another writer takes ownership of the key.
  pub fn supersede(&self, key: &str) {
    let had_inflight = self
      .keys
      .lock()
      .remove(key)
      .map(|state| state.inflight.is_some())
      .unwrap_or(false);
    if had_inflight {
      tracing::debug!(key, "in-flight fetch superseded");
      self.store.settle(key);
    }
  }

  pub fn in_flight(&self, key: &str) -> bool {
    self
      .keys
      .lock()
      .get(key)
      .map(|state| state.inflight.is_some())
      .unwrap_or(false)
  }

  /// How long the current in-flight fetch for `key` has been running.
  pub fn in_flight_for(&self, key: &str) -> Option<std::time::Duration> {
    self
      .keys
      .lock()
      .get(key)
      .and_then(|state| state.inflight.as_ref())
      .map(|task| task.started_at.elapsed())
  }

  pub fn stats(&self) -> FetchStats {
    FetchStats {
      runs: self.runs.load(Ordering::Relaxed),
      deduplicated: self.deduplicated.load(Ordering::Relaxed),
      discarded: self.discarded.load(Ordering::Relaxed),
    }
  }

  /// Number of keys with a fetch outstanding.
  pub fn tracked_keys(&self) -> usize {
    self.keys.lock().len()
  }

  fn join_or_start(self: &Arc<Self>, key: &str, producer: &ProducerRef) -> SharedFetch {
    let claim = {
      let mut keys = self.keys.lock();
      let state = keys.entry(key.to_string()).or_default();
      if let Some(task) = &state.inflight {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key, seq = task.seq, "joined in-flight fetch");
        return task.future.clone();
      }
      self.claim(key, state)
    };
    self.launch(key, claim, producer.clone())
  }

  /// Claim the in-flight slot. Must be called with the key map locked.
  fn claim(&self, key: &str, state: &mut KeyState) -> Claim {
    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
    state.seq = seq;
    let (tx, rx) = oneshot::channel();

    let future: SharedFetch = rx
      .map(|result| result.unwrap_or(Err(FetchError::Cancelled)))
      .boxed()
      .shared();
    state.inflight = Some(FetchTask {
      seq,
      started_at: Instant::now(),
      future: future.clone(),
    });
    self.runs.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(key, seq, "starting fetch");
    Claim { seq, future, tx }
  }

  /// Raise the flag, then spawn the producer. The flag write lands
  /// before the producer can complete, and outside the key map lock so
  /// subscriber callbacks may call back into the fetcher.
  fn launch(self: &Arc<Self>, key: &str, claim: Claim, producer: ProducerRef) -> SharedFetch {
    self.flag_started(key);

    let Claim { seq, future, tx } = claim;
    let this = self.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      let result = producer.produce().await;
      this.complete(&key, seq, &result);
      let _ = tx.send(result);
    });

    future
  }

  /// Loading for a first fetch, revalidating when data is already shown.
  fn flag_started(&self, key: &str) {
    let has_data = self
      .store
      .get(key)
      .map(|entry| entry.has_data())
      .unwrap_or(false);
    if has_data {
      self.store.mark_revalidating(key);
    } else {
      self.store.mark_loading(key);
    }
  }

  fn complete(&self, key: &str, seq: u64, result: &Result<serde_json::Value, FetchError>) {
    let (latest, idle) = {
      let mut keys = self.keys.lock();
      match keys.get_mut(key) {
        Some(state) => {
          if state.inflight.as_ref().map(|t| t.seq) == Some(seq) {
            state.inflight = None;
          }
          let latest = state.seq == seq;
          let idle = state.inflight.is_none();
          if idle {
            keys.remove(key);
          }
          (latest, idle)
        }
        None => (false, true),
      }
    };

    if !latest {
      self.discarded.fetch_add(1, Ordering::Relaxed);
      tracing::debug!(key, seq, "discarding superseded fetch result");
      // nothing else is fetching this key, so no flag should stay raised
      if idle {
        self.store.settle(key);
      }
      return;
    }

    match result {
      Ok(value) => self.store.set(key, value.clone()),
      Err(e) => {
        tracing::warn!(key, "fetch failed: {}", e);
        self.store.set_error(key, e.clone());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetcher::producer;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn counting(value: serde_json::Value) -> (Arc<AtomicUsize>, ProducerRef) {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let p = producer(move || {
      let calls = calls2.clone();
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(value)
      }
    });
    (calls, p)
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_fetch_sets_loading_then_data() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let (calls, p) = counting(json!({"ok": true}));

    let lookup = fetcher.request("k", &p, &HookOptions::default());
    assert!(matches!(lookup, Lookup::Pending(_)));
    assert!(store.get("k").unwrap().is_loading);

    let Lookup::Pending(future) = lookup else {
      unreachable!()
    };
    assert_eq!(future.await, Ok(json!({"ok": true})));
    let entry = store.get("k").unwrap();
    assert!(!entry.is_loading);
    assert_eq!(entry.data, Some(json!({"ok": true})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_keeps_previous_data() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    store.set("k", json!(1));

    let failing = producer(|| async { Err(FetchError::failed("offline")) });
    let result = fetcher.refresh("k", &failing).await;
    assert_eq!(result, Err(FetchError::failed("offline")));

    let entry = store.get("k").unwrap();
    assert_eq!(entry.data, Some(json!(1)));
    assert_eq!(entry.error, Some(FetchError::failed("offline")));
    assert!(!entry.is_revalidating);
  }

  #[tokio::test(start_paused = true)]
  async fn test_revalidate_skips_fresh_entries() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let (calls, p) = counting(json!(2));
    store.set("k", json!(1));

    assert!(fetcher
      .revalidate("k", &p, &HookOptions::default())
      .is_none());
    tokio::time::advance(Duration::from_secs(3)).await;
    let future = fetcher
      .revalidate("k", &p, &HookOptions::default())
      .expect("stale entry revalidates");
    assert!(store.get("k").unwrap().is_revalidating);
    assert_eq!(future.await, Ok(json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_supersede_discards_inflight_result() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let (_, p) = counting(json!("polled"));

    let future = fetcher.refresh("k", &p);
    fetcher.supersede("k");
    store.set("k", json!("pushed"));

    // the waiter still gets its own result
    assert_eq!(future.await, Ok(json!("polled")));
    assert_eq!(store.get("k").unwrap().data, Some(json!("pushed")));
    assert_eq!(fetcher.stats().discarded, 1);
    assert!(!fetcher.in_flight("k"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_instant_producer_never_leaves_flag_raised() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let instant = producer(|| async { Ok(json!("done")) });

    for i in 0..500 {
      let key = format!("k{}", i % 8);
      if i % 2 == 0 {
        store.set(&key, json!("old"));
      }
      assert_eq!(fetcher.refresh(&key, &instant).await, Ok(json!("done")));
      let entry = store.get(&key).unwrap();
      assert!(!entry.is_loading, "{} left loading", key);
      assert!(!entry.is_revalidating, "{} left revalidating", key);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_key_state_pruned_once_idle() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let (_, p) = counting(json!(1));

    let a = fetcher.refresh("a", &p);
    let b = fetcher.refresh("b", &p);
    assert_eq!(fetcher.tracked_keys(), 2);

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(fetcher.tracked_keys(), 0);

    // a superseded run against a pruned key is still discarded
    let late = fetcher.refresh("a", &p);
    fetcher.supersede("a");
    assert_eq!(fetcher.tracked_keys(), 0);
    let fresh = fetcher.refresh("a", &producer(|| async { Ok(json!(2)) }));
    assert_eq!(fresh.await, Ok(json!(2)));
    assert_eq!(late.await, Ok(json!(1)));
    assert_eq!(store.get("a").unwrap().data, Some(json!(2)));
    assert!(!store.get("a").unwrap().is_revalidating);
    assert_eq!(fetcher.tracked_keys(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_run_clears_its_flag() {
    let store = Arc::new(CacheStore::default());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let (_, p) = counting(json!(1));

    let future = fetcher.refresh("k", &p);
    assert!(store.get("k").unwrap().is_loading);
    fetcher.supersede("k");
    assert!(!store.get("k").unwrap().is_loading);

    future.await.unwrap();
    let entry = store.get("k").unwrap();
    assert!(!entry.is_loading);
    assert_eq!(entry.data, None);
  }
}
