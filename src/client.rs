//! Application-level entry point wiring the cache layers together

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cache::{run_gc_task, CacheStore};
use crate::channel::{PushChannel, PushChannelBuilder, PushTransport};
use crate::config::{HookOptions, SwrConfig};
use crate::error::FetchError;
use crate::fetcher::{Fetcher, ProducerRef, SharedFetch};
use crate::hooks::{MetricsSocket, SwrHandle};
use crate::mutation::OptimisticManager;
use crate::triggers::{LifecycleEvent, Triggers};

struct ClientInner {
  config: SwrConfig,
  store: Arc<CacheStore>,
  fetcher: Arc<Fetcher>,
  triggers: Arc<Triggers>,
  mutations: OptimisticManager,
  gc: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
  fn drop(&mut self) {
    if let Some(gc) = self.gc.get_mut().take() {
      gc.abort();
    }
  }
}

/// One cache service instance. Create it at startup (or per test) and
/// hand clones to whatever needs it.
#[derive(Clone)]
pub struct SwrClient {
  inner: Arc<ClientInner>,
}

impl Default for SwrClient {
  fn default() -> Self {
    Self::new(SwrConfig::default())
  }
}

impl SwrClient {
  pub fn new(config: SwrConfig) -> Self {
    let store = Arc::new(CacheStore::new(config.cache.gc_grace()));
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let triggers = Arc::new(Triggers::new(fetcher.clone()));
    Self {
      inner: Arc::new(ClientInner {
        config,
        store,
        fetcher,
        triggers,
        mutations: OptimisticManager::new(),
        gc: Mutex::new(None),
      }),
    }
  }

  pub fn config(&self) -> &SwrConfig {
    &self.inner.config
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.inner.store
  }

  pub fn fetcher(&self) -> &Arc<Fetcher> {
    &self.inner.fetcher
  }

  pub fn triggers(&self) -> &Arc<Triggers> {
    &self.inner.triggers
  }

  pub fn mutations(&self) -> &OptimisticManager {
    &self.inner.mutations
  }

  /// Start the periodic sweep of orphaned entries. Idempotent.
  pub fn start_gc(&self) {
    let mut gc = self.inner.gc.lock();
    if gc.is_some() {
      return;
    }
    let interval = self.inner.config.cache.gc_interval();
    *gc = Some(tokio::spawn(run_gc_task(self.inner.store.clone(), interval)));
  }

  /// Bind a consumer to `key` with the configured default options.
  pub fn use_swr<T: DeserializeOwned>(&self, key: &str, producer: ProducerRef) -> SwrHandle<T> {
    self.use_swr_with(key, producer, self.inner.config.defaults)
  }

  pub fn use_swr_with<T: DeserializeOwned>(
    &self,
    key: &str,
    producer: ProducerRef,
    options: HookOptions,
  ) -> SwrHandle<T> {
    SwrHandle::new(
      &self.inner.fetcher,
      &self.inner.triggers,
      key,
      producer,
      options,
    )
  }

  /// A push channel builder preloaded with this client's channel section
  /// and default options.
  pub fn push_channel(&self, transport: Arc<dyn PushTransport>) -> PushChannelBuilder {
    PushChannel::builder(transport, self.inner.fetcher.clone())
      .config(self.inner.config.channel.clone())
      .options(self.inner.config.defaults)
  }

  pub fn use_metrics_socket(&self, channel: &PushChannel) -> MetricsSocket {
    MetricsSocket::new(channel)
  }

  /// Manual refresh through the key's registered producer.
  pub fn refresh(&self, key: &str) -> Option<SharedFetch> {
    self.inner.triggers.refresh(key)
  }

  /// Run `producer` for `key` unconditionally and decode the result.
  /// Used to reconcile after a successful mutation.
  pub async fn refetch<T: DeserializeOwned>(
    &self,
    key: &str,
    producer: &ProducerRef,
  ) -> Result<T, FetchError> {
    let value = self.inner.fetcher.refresh(key, producer).await?;
    Ok(serde_json::from_value(value)?)
  }

  pub fn dispatch(&self, event: LifecycleEvent) -> Vec<String> {
    self.inner.triggers.dispatch(event)
  }

  /// Forward lifecycle events from a host-side broadcast in the
  /// background.
  pub fn listen(&self, rx: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(self.inner.triggers.clone().listen(rx))
  }

  /// Stop background work and drop every cached entry.
  pub fn shutdown(&self) {
    if let Some(gc) = self.inner.gc.lock().take() {
      gc.abort();
    }
    self.inner.store.clear();
    tracing::debug!("swr client shut down");
  }
}
