use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::HookOptions;
use crate::fetcher::{Fetcher, ProducerRef, SharedFetch};

/// Environment events a host forwards to the trigger registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
  /// The window (or app) regained focus
  Focus,
  /// Network came back
  Online,
  /// Network went away
  Offline,
}

struct Registered {
  producer: ProducerRef,
  options: HookOptions,
}

#[derive(Default)]
struct KeyRegistrations {
  consumers: BTreeMap<u64, Registered>,
  last_focus: Option<Instant>,
}

/// Tracks which consumers asked for which automatic revalidations.
pub struct Triggers {
  fetcher: Arc<Fetcher>,
  keys: Mutex<HashMap<String, KeyRegistrations>>,
  next_id: AtomicU64,
  online: AtomicBool,
}

impl Triggers {
  pub fn new(fetcher: Arc<Fetcher>) -> Self {
    Self {
      fetcher,
      keys: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(0),
      online: AtomicBool::new(true),
    }
  }

  pub fn register(
    self: &Arc<Self>,
    key: &str,
    producer: ProducerRef,
    options: HookOptions,
  ) -> Registration {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .keys
      .lock()
      .entry(key.to_string())
      .or_default()
      .consumers
      .insert(id, Registered { producer, options });

    Registration {
      triggers: Arc::downgrade(self),
      key: key.to_string(),
      id,
    }
  }

  fn unregister(&self, key: &str, id: u64) {
    let mut keys = self.keys.lock();
    if let Some(regs) = keys.get_mut(key) {
      regs.consumers.remove(&id);
      if regs.consumers.is_empty() {
        keys.remove(key);
      }
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::Relaxed)
  }

  pub fn registered_keys(&self) -> Vec<String> {
    self.keys.lock().keys().cloned().collect()
  }

  /// Handle one lifecycle event. Returns the keys that were revalidated.
  pub fn dispatch(&self, event: LifecycleEvent) -> Vec<String> {
    let targets = match event {
      LifecycleEvent::Focus => self.focus_targets(),
      LifecycleEvent::Online => {
        if self.online.swap(true, Ordering::Relaxed) {
          // already online, not a transition
          Vec::new()
        } else {
          tracing::info!("network reconnected, revalidating");
          self.select(|o| o.revalidate_on_reconnect)
        }
      }
      LifecycleEvent::Offline => {
        self.online.store(false, Ordering::Relaxed);
        Vec::new()
      }
    };

    let mut revalidated = Vec::with_capacity(targets.len());
    for (key, producer, options) in targets {
      if self.fetcher.revalidate(&key, &producer, &options).is_some() {
        revalidated.push(key);
      }
    }
    revalidated
  }

  /// Manual refresh through the first registered consumer of `key`.
  /// Bypasses the deduping interval.
  pub fn refresh(&self, key: &str) -> Option<SharedFetch> {
    let producer = self
      .keys
      .lock()
      .get(key)
      .and_then(|regs| regs.consumers.values().next())
      .map(|reg| reg.producer.clone())?;
    Some(self.fetcher.refresh(key, &producer))
  }

  /// Forward events from a broadcast source until it closes.
  pub async fn listen(self: Arc<Self>, mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
      match rx.recv().await {
        Ok(event) => {
          let keys = self.dispatch(event);
          tracing::debug!(?event, revalidated = keys.len(), "lifecycle event");
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
          tracing::warn!("lifecycle listener lagged by {} events", n);
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  }

  fn focus_targets(&self) -> Vec<(String, ProducerRef, HookOptions)> {
    let mut keys = self.keys.lock();
    let now = Instant::now();
    let mut targets = Vec::new();
    for (key, regs) in keys.iter_mut() {
      let Some(reg) = regs
        .consumers
        .values()
        .find(|r| r.options.revalidate_on_focus)
      else {
        continue;
      };
      let throttle = reg.options.focus_throttle_interval();
      let throttled = regs
        .last_focus
        .map(|at| now.duration_since(at) < throttle)
        .unwrap_or(false);
      if throttled {
        continue;
      }
      targets.push((key.clone(), reg.producer.clone(), reg.options));
      regs.last_focus = Some(now);
    }
    targets
  }

  fn select(&self, pred: impl Fn(&HookOptions) -> bool) -> Vec<(String, ProducerRef, HookOptions)> {
    self
      .keys
      .lock()
      .iter()
      .filter_map(|(key, regs)| {
        regs
          .consumers
          .values()
          .find(|r| pred(&r.options))
          .map(|r| (key.clone(), r.producer.clone(), r.options))
      })
      .collect()
  }
}

/// Guard for one consumer's trigger registration. Unregisters on drop.
#[must_use = "dropping a registration unregisters immediately"]
pub struct Registration {
  triggers: Weak<Triggers>,
  key: String,
  id: u64,
}

impl Registration {
  pub fn key(&self) -> &str {
    &self.key
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    if let Some(triggers) = self.triggers.upgrade() {
      triggers.unregister(&self.key, self.id);
    }
  }
}
