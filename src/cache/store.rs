//! Cache store implementation

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::entry::CacheEntry;
use crate::error::FetchError;

/// Identifies one subscriber of one key. Ids grow monotonically, so
/// iterating a key's subscribers in id order is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

type Callback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;
type Updater = Box<dyn FnOnce(Option<&serde_json::Value>) -> Option<serde_json::Value> + Send>;

/// A pending mutation of one slot. Queued while the slot is notifying.
enum Write {
  Data(serde_json::Value),
  Error(FetchError),
  Update(Updater),
  Loading,
  Revalidating,
  Settle,
}

struct Slot {
  entry: CacheEntry,
  subscribers: BTreeMap<SubscriberId, Callback>,
  notifying: bool,
  deferred: VecDeque<Write>,
  orphaned_at: Option<Instant>,
}

impl Slot {
  fn new(key: &str) -> Self {
    Self {
      entry: CacheEntry::new(key),
      subscribers: BTreeMap::new(),
      notifying: false,
      deferred: VecDeque::new(),
      orphaned_at: Some(Instant::now()),
    }
  }

  /// Apply a write, returning whether the entry changed.
  fn apply(&mut self, write: Write) -> bool {
    let entry = &mut self.entry;
    match write {
      Write::Data(value) => {
        entry.data = Some(value);
        entry.error = None;
        entry.fetched_at = Some(Instant::now());
        entry.updated_at = Some(Utc::now());
        entry.is_loading = false;
        entry.is_revalidating = false;
        true
      }
      Write::Error(error) => {
        entry.error = Some(error);
        entry.is_loading = false;
        entry.is_revalidating = false;
        true
      }
      Write::Update(f) => match f(entry.data.as_ref()) {
        Some(value) => self.apply(Write::Data(value)),
        None => false,
      },
      Write::Loading => !std::mem::replace(&mut entry.is_loading, true),
      Write::Revalidating => !std::mem::replace(&mut entry.is_revalidating, true),
      Write::Settle => {
        let changed = entry.is_loading || entry.is_revalidating;
        entry.is_loading = false;
        entry.is_revalidating = false;
        changed
      }
    }
  }

  fn round(&self) -> (CacheEntry, Vec<Callback>) {
    (
      self.entry.clone(),
      self.subscribers.values().cloned().collect(),
    )
  }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub subscribers: usize,
  pub hits: u64,
  pub misses: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

/// Keyed map from cache key to entry plus its subscriber set.
///
/// One instance is created per application (or per test) and shared as
/// `Arc<CacheStore>`. Writes to a key are applied and announced to every
/// subscriber of that key, in registration order, before the next write
/// to the same key is applied. A write issued while a key is notifying
/// (from a subscriber callback or a concurrent task) is queued and
/// applied once the current round finishes.
pub struct CacheStore {
  slots: Mutex<HashMap<String, Slot>>,
  next_subscriber: AtomicU64,
  gc_grace: Duration,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(Duration::from_secs(300))
  }
}

impl CacheStore {
  pub fn new(gc_grace: Duration) -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      next_subscriber: AtomicU64::new(0),
      gc_grace,
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
    }
  }

  /// Register `callback` for `key`. Creates a loading entry if the key is
  /// unknown. Dropping the returned guard unsubscribes.
  pub fn subscribe<F>(self: &Arc<Self>, key: &str, callback: F) -> Subscription
  where
    F: Fn(&CacheEntry) + Send + Sync + 'static,
  {
    self.register(key, |_| -> Callback { Arc::new(callback) })
  }

  /// Subscribe and mirror the entry into a `watch` channel. The receiver
  /// starts at the entry as it was when the subscription was taken.
  pub fn subscribe_watch(
    self: &Arc<Self>,
    key: &str,
  ) -> (Subscription, watch::Receiver<CacheEntry>) {
    let mut receiver = None;
    let sub = self.register(key, |entry| -> Callback {
      let (tx, rx) = watch::channel(entry.clone());
      receiver = Some(rx);
      Arc::new(move |entry: &CacheEntry| {
        tx.send_replace(entry.clone());
      })
    });
    let rx = match receiver {
      Some(rx) => rx,
      None => watch::channel(CacheEntry::new(key)).1,
    };
    (sub, rx)
  }

  fn register(
    self: &Arc<Self>,
    key: &str,
    make: impl FnOnce(&CacheEntry) -> Callback,
  ) -> Subscription {
    let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(key.to_string())
      .or_insert_with(|| Slot::new(key));
    let callback = make(&slot.entry);
    slot.subscribers.insert(id, callback);
    slot.orphaned_at = None;
    tracing::trace!(key, subscriber = id.0, "subscribed");

    Subscription {
      store: Arc::downgrade(self),
      key: key.to_string(),
      id,
    }
  }

  /// Subscribe and receive every change on a queue instead of a callback.
  pub fn subscribe_channel(
    self: &Arc<Self>,
    key: &str,
  ) -> (Subscription, mpsc::UnboundedReceiver<CacheEntry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = self.subscribe(key, move |entry| {
      let _ = tx.send(entry.clone());
    });
    (sub, rx)
  }

  fn unsubscribe(&self, key: &str, id: SubscriberId) {
    let mut slots = self.slots.lock();
    let Some(slot) = slots.get_mut(key) else {
      return;
    };
    slot.subscribers.remove(&id);
    tracing::trace!(key, subscriber = id.0, "unsubscribed");

    if slot.subscribers.is_empty() {
      if self.gc_grace.is_zero() && !slot.notifying {
        slots.remove(key);
        tracing::debug!(key, "dropped unsubscribed cache entry");
      } else {
        slot.orphaned_at = Some(Instant::now());
      }
    }
  }

  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let slots = self.slots.lock();
    match slots.get(key) {
      Some(slot) if slot.entry.has_data() => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone())
      }
      Some(slot) => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone())
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  /// Store fresh data: clears the error and both flags.
  pub fn set(&self, key: &str, data: serde_json::Value) {
    self.write(key, Write::Data(data));
  }

  /// Record a failure while keeping the previous data visible.
  pub fn set_error(&self, key: &str, error: FetchError) {
    self.write(key, Write::Error(error));
  }

  /// Read-modify-write against the current value. Returning `None`
  /// leaves the entry untouched and notifies nobody.
  pub fn update<F>(&self, key: &str, f: F)
  where
    F: FnOnce(Option<&serde_json::Value>) -> Option<serde_json::Value> + Send + 'static,
  {
    self.write(key, Write::Update(Box::new(f)));
  }

  pub fn mark_loading(&self, key: &str) {
    self.write(key, Write::Loading);
  }

  pub fn mark_revalidating(&self, key: &str) {
    self.write(key, Write::Revalidating);
  }

  /// Clear both flags without touching data or error.
  pub fn settle(&self, key: &str) {
    self.write(key, Write::Settle);
  }

  fn write(&self, key: &str, write: Write) {
    let mut round = {
      let mut slots = self.slots.lock();
      let slot = slots
        .entry(key.to_string())
        .or_insert_with(|| Slot::new(key));
      if slot.notifying {
        slot.deferred.push_back(write);
        return;
      }
      if !slot.apply(write) {
        return;
      }
      slot.notifying = true;
      slot.round()
    };

    loop {
      let (entry, callbacks) = &round;
      for callback in callbacks {
        callback(entry);
      }

      let mut slots = self.slots.lock();
      let Some(slot) = slots.get_mut(key) else {
        return;
      };
      let mut next = None;
      while let Some(write) = slot.deferred.pop_front() {
        if slot.apply(write) {
          next = Some(slot.round());
          break;
        }
      }
      match next {
        Some(r) => round = r,
        None => {
          slot.notifying = false;
          if slot.subscribers.is_empty() && self.gc_grace.is_zero() {
            slots.remove(key);
          }
          return;
        }
      }
    }
  }

  pub fn remove(&self, key: &str) -> Option<CacheEntry> {
    self.slots.lock().remove(key).map(|slot| slot.entry)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.slots.lock().contains_key(key)
  }

  pub fn keys(&self) -> Vec<String> {
    self.slots.lock().keys().cloned().collect()
  }

  pub fn subscriber_count(&self, key: &str) -> usize {
    self
      .slots
      .lock()
      .get(key)
      .map(|slot| slot.subscribers.len())
      .unwrap_or(0)
  }

  /// Drop entries that have had no subscribers for longer than the grace
  /// period.
  pub fn sweep(&self) -> usize {
    let mut slots = self.slots.lock();
    let before = slots.len();
    let grace = self.gc_grace;
    slots.retain(|_, slot| {
      !(slot.subscribers.is_empty()
        && !slot.notifying
        && slot
          .orphaned_at
          .map(|at| at.elapsed() >= grace)
          .unwrap_or(false))
    });
    before - slots.len()
  }

  pub fn clear(&self) {
    self.slots.lock().clear();
  }

  pub fn stats(&self) -> CacheStats {
    let slots = self.slots.lock();
    CacheStats {
      keys: slots.len(),
      subscribers: slots.values().map(|s| s.subscribers.len()).sum(),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
    }
  }
}

/// Guard for one registered subscriber. Unsubscribes on drop.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
  store: Weak<CacheStore>,
  key: String,
  id: SubscriberId,
}

impl Subscription {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn id(&self) -> SubscriberId {
    self.id
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .finish()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(store) = self.store.upgrade() {
      store.unsubscribe(&self.key, self.id);
    }
  }
}

/// Periodic sweep of orphaned entries
pub async fn run_gc_task(store: Arc<CacheStore>, interval: Duration) {
  loop {
    tokio::time::sleep(interval).await;
    let removed = store.sweep();
    if removed > 0 {
      tracing::debug!("Swept {} orphaned cache entries", removed);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Mutex as StdMutex;

  fn recorder() -> (
    Arc<StdMutex<Vec<String>>>,
    impl Fn(&'static str) -> Box<dyn Fn(&CacheEntry) + Send + Sync>,
  ) {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let log2 = log.clone();
    let make = move |name: &'static str| {
      let log = log2.clone();
      Box::new(move |entry: &CacheEntry| {
        log
          .lock()
          .unwrap()
          .push(format!("{}={}", name, entry.data.clone().unwrap_or_default()));
      }) as Box<dyn Fn(&CacheEntry) + Send + Sync>
    };
    (log, make)
  }

  #[test]
  fn test_subscribe_creates_loading_entry() {
    let store = Arc::new(CacheStore::default());
    let _sub = store.subscribe("k", |_| {});
    let entry = store.get("k").unwrap();
    assert!(entry.is_loading);
    assert_eq!(store.subscriber_count("k"), 1);
  }

  #[test]
  fn test_notification_order_is_registration_order() {
    let store = Arc::new(CacheStore::default());
    let (log, make) = recorder();
    let _a = store.subscribe("k", make("a"));
    let _b = store.subscribe("k", make("b"));
    let _c = store.subscribe("k", make("c"));

    store.set("k", json!(1));
    assert_eq!(*log.lock().unwrap(), vec!["a=1", "b=1", "c=1"]);
  }

  #[test]
  fn test_set_error_keeps_data() {
    let store = Arc::new(CacheStore::default());
    store.set("k", json!({"rows": 3}));
    store.mark_revalidating("k");
    store.set_error("k", FetchError::failed("boom"));

    let entry = store.get("k").unwrap();
    assert_eq!(entry.data, Some(json!({"rows": 3})));
    assert_eq!(entry.error, Some(FetchError::failed("boom")));
    assert!(!entry.is_loading);
    assert!(!entry.is_revalidating);
  }

  #[test]
  fn test_reentrant_write_is_deferred() {
    let store = Arc::new(CacheStore::default());
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let store2 = store.clone();
    let seen_a = seen.clone();
    let _a = store.subscribe("k", move |entry| {
      let v = entry.data.clone().unwrap_or_default();
      seen_a.lock().unwrap().push(format!("a={}", v));
      if v == json!(1) {
        store2.set("k", json!(2));
      }
    });
    let seen_b = seen.clone();
    let _b = store.subscribe("k", move |entry| {
      seen_b
        .lock()
        .unwrap()
        .push(format!("b={}", entry.data.clone().unwrap_or_default()));
    });

    store.set("k", json!(1));
    // b observes 1 before the write issued from a's callback lands
    assert_eq!(*seen.lock().unwrap(), vec!["a=1", "b=1", "a=2", "b=2"]);
    assert_eq!(store.get("k").unwrap().data, Some(json!(2)));
  }

  #[test]
  fn test_update_none_is_noop() {
    let store = Arc::new(CacheStore::default());
    let (log, make) = recorder();
    let _a = store.subscribe("k", make("a"));
    store.update("k", |_| None);
    assert!(log.lock().unwrap().is_empty());

    store.update("k", |cur| {
      assert!(cur.is_none());
      Some(json!(5))
    });
    assert_eq!(*log.lock().unwrap(), vec!["a=5"]);
  }

  #[test]
  fn test_drop_unsubscribes_with_zero_grace() {
    let store = Arc::new(CacheStore::new(Duration::ZERO));
    let sub = store.subscribe("k", |_| {});
    store.set("k", json!(1));
    drop(sub);
    assert!(!store.contains("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweep_after_grace() {
    let store = Arc::new(CacheStore::new(Duration::from_secs(10)));
    let sub = store.subscribe("k", |_| {});
    store.set("k", json!(1));
    drop(sub);

    assert_eq!(store.sweep(), 0);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.sweep(), 1);
    assert!(!store.contains("k"));
  }

  #[test]
  fn test_stats() {
    let store = Arc::new(CacheStore::default());
    assert!(store.get("missing").is_none());
    store.set("k", json!(1));
    let _ = store.get("k");
    let stats = store.stats();
    assert_eq!(stats.keys, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.5);
  }

  #[test]
  fn test_subscribe_watch_starts_at_current_entry() {
    let store = Arc::new(CacheStore::default());
    store.set("k", json!("cached"));
    let (_sub, mut rx) = store.subscribe_watch("k");
    assert_eq!(rx.borrow().data, Some(json!("cached")));

    store.set("k", json!("next"));
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().data, Some(json!("next")));
  }
}
