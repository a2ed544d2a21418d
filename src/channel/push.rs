use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::events::{
  merge_quick_metrics, merge_service_alert, ClientEvent, MetricsSnapshot, Notification, PushEvent,
  SessionAction,
};
use super::transport::{PushConnection, PushTransport};
use crate::cache::CacheStore;
use crate::config::{ChannelSection, HookOptions};
use crate::error::{ChannelError, SwrError};
use crate::fetcher::{Fetcher, ProducerRef};
use crate::triggers::Poller;

/// Connection state machine:
/// `Disconnected -> Connecting -> Connected -> (Error | Disconnected)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Error,
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionState::Disconnected => write!(f, "disconnected"),
      ConnectionState::Connecting => write!(f, "connecting"),
      ConnectionState::Connected => write!(f, "connected"),
      ConnectionState::Error => write!(f, "error"),
    }
  }
}

struct Inner {
  transport: Arc<dyn PushTransport>,
  store: Arc<CacheStore>,
  fetcher: Arc<Fetcher>,
  config: ChannelSection,
  options: HookOptions,
  poll_producer: Option<ProducerRef>,
  poller: Option<Poller>,
  state: watch::Sender<ConnectionState>,
  last_error: Mutex<Option<ChannelError>>,
  notifications: broadcast::Sender<Notification>,
  commands: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
  leases: Mutex<usize>,
  task: Mutex<Option<JoinHandle<()>>>,
}

/// Server push channel writing events straight into the cache.
///
/// Owns the configured metrics and sessions keys while connected. While
/// it is down, and a fallback producer is configured, a [`Poller`] owns
/// the metrics key instead. Cloning shares the same connection.
#[derive(Clone)]
pub struct PushChannel {
  inner: Arc<Inner>,
}

pub struct PushChannelBuilder {
  transport: Arc<dyn PushTransport>,
  fetcher: Arc<Fetcher>,
  config: ChannelSection,
  options: HookOptions,
  poll_producer: Option<ProducerRef>,
}

impl PushChannelBuilder {
  pub fn config(mut self, config: ChannelSection) -> Self {
    self.config = config;
    self
  }

  pub fn options(mut self, options: HookOptions) -> Self {
    self.options = options;
    self
  }

  /// HTTP producer for the metrics key, polled while the channel is down.
  pub fn fallback(mut self, producer: ProducerRef) -> Self {
    self.poll_producer = Some(producer);
    self
  }

  pub fn build(self) -> PushChannel {
    let poller = match (&self.poll_producer, self.options.fallback_to_polling) {
      (Some(producer), true) => Some(Poller::new(
        self.fetcher.clone(),
        self.config.keys.metrics.clone(),
        producer.clone(),
        self.config.polling_interval(),
      )),
      _ => None,
    };
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    let (notifications, _) = broadcast::channel(256);

    PushChannel {
      inner: Arc::new(Inner {
        transport: self.transport,
        store: self.fetcher.store().clone(),
        fetcher: self.fetcher,
        config: self.config,
        options: self.options,
        poll_producer: self.poll_producer,
        poller,
        state,
        last_error: Mutex::new(None),
        notifications,
        commands: Mutex::new(None),
        leases: Mutex::new(0),
        task: Mutex::new(None),
      }),
    }
  }
}

impl PushChannel {
  pub fn builder(transport: Arc<dyn PushTransport>, fetcher: Arc<Fetcher>) -> PushChannelBuilder {
    PushChannelBuilder {
      transport,
      fetcher,
      config: ChannelSection::default(),
      options: HookOptions::default(),
      poll_producer: None,
    }
  }

  pub fn config(&self) -> &ChannelSection {
    &self.inner.config
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.inner.store
  }

  pub fn state(&self) -> ConnectionState {
    *self.inner.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
    self.inner.state.subscribe()
  }

  pub fn last_error(&self) -> Option<ChannelError> {
    self.inner.last_error.lock().clone()
  }

  pub fn notifications(&self) -> broadcast::Receiver<Notification> {
    self.inner.notifications.subscribe()
  }

  pub fn is_polling(&self) -> bool {
    self
      .inner
      .poller
      .as_ref()
      .map(|p| p.is_running())
      .unwrap_or(false)
  }

  pub fn lease_count(&self) -> usize {
    *self.inner.leases.lock()
  }

  /// Take a reference on the channel. The first lease connects (with
  /// `auto_connect`); dropping the last one tears the connection down.
  ///
  /// The count stays locked across the connect and disconnect calls, so a
  /// release racing an attach cannot abort the loop the attach relies on.
  pub fn attach(&self) -> ChannelLease {
    let mut leases = self.inner.leases.lock();
    *leases += 1;
    if *leases == 1 {
      if self.inner.options.auto_connect {
        self.connect();
      } else {
        self.inner.start_fallback();
      }
    }
    drop(leases);
    ChannelLease {
      channel: self.clone(),
    }
  }

  fn release(&self) {
    let mut leases = self.inner.leases.lock();
    *leases = leases.saturating_sub(1);
    if *leases == 0 {
      tracing::debug!("last channel lease released");
      self.disconnect();
    }
  }

  /// Whether the connection loop is running.
  pub fn is_active(&self) -> bool {
    self
      .inner
      .task
      .lock()
      .as_ref()
      .map(|t| !t.is_finished())
      .unwrap_or(false)
  }

  /// Start the connection loop if it isn't running.
  pub fn connect(&self) {
    let mut task = self.inner.task.lock();
    if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
      return;
    }
    *task = Some(tokio::spawn(run(self.inner.clone())));
  }

  /// Stop the connection loop and any fallback polling.
  pub fn disconnect(&self) {
    if let Some(task) = self.inner.task.lock().take() {
      task.abort();
    }
    self.inner.commands.lock().take();
    if let Some(poller) = &self.inner.poller {
      poller.stop();
    }
    self.inner.set_state(ConnectionState::Disconnected);
  }

  /// Send a client event over the live connection.
  pub fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
    match self.inner.commands.lock().as_ref() {
      Some(tx) => tx.send(event).map_err(|_| ChannelError::Closed),
      None => Err(ChannelError::Closed),
    }
  }

  /// Ask for fresh metrics: over the channel when connected, otherwise
  /// through the fallback producer.
  pub async fn refresh_metrics(&self) -> Result<(), SwrError> {
    if self.state() == ConnectionState::Connected {
      return Ok(self.emit(ClientEvent::RefreshMetrics)?);
    }
    match &self.inner.poll_producer {
      Some(producer) => {
        self
          .inner
          .fetcher
          .refresh(&self.inner.config.keys.metrics, producer)
          .await?;
        Ok(())
      }
      None => Err(ChannelError::Closed.into()),
    }
  }

  pub fn refresh_sessions(&self) -> Result<(), ChannelError> {
    self.emit(ClientEvent::RefreshSessions)
  }

  /// Apply one push event to the cache. The connection loop calls this
  /// for every event it receives.
  pub fn apply(&self, event: PushEvent) {
    self.inner.apply(event);
  }
}

/// Reference held by one consumer of a channel-backed key.
#[must_use = "dropping a lease releases the channel immediately"]
pub struct ChannelLease {
  channel: PushChannel,
}

impl Drop for ChannelLease {
  fn drop(&mut self) {
    self.channel.release();
  }
}

impl Inner {
  fn set_state(&self, state: ConnectionState) {
    let old = self.state.send_replace(state);
    if old != state {
      tracing::info!("push channel {} -> {}", old, state);
    }
  }

  fn start_fallback(&self) {
    if let Some(poller) = &self.poller {
      poller.start();
    }
  }

  fn on_connected(&self, commands: mpsc::UnboundedSender<ClientEvent>) {
    // polling has to be gone before the first pushed write lands
    if let Some(poller) = &self.poller {
      poller.stop();
    }
    self.last_error.lock().take();
    if commands.send(ClientEvent::RequestInitialData).is_err() {
      tracing::warn!("connection closed before requesting initial data");
    }
    *self.commands.lock() = Some(commands);
    self.set_state(ConnectionState::Connected);
  }

  fn on_dropped(&self, state: ConnectionState, error: ChannelError) {
    self.commands.lock().take();
    *self.last_error.lock() = Some(error);
    self.set_state(state);
    self.start_fallback();
  }

  fn notify(&self, notification: Notification) {
    let _ = self.notifications.send(notification);
  }

  fn apply(&self, event: PushEvent) {
    let keys = &self.config.keys;
    tracing::trace!(event = event.name(), "push event");
    match event {
      PushEvent::MetricsUpdate(update) => {
        let snapshot = MetricsSnapshot {
          health: update.health,
          metrics: update.metrics,
          timestamp: update.timestamp,
        };
        self.store.set(&keys.metrics, snapshot.to_value());
      }
      PushEvent::InitialData(data) => {
        let snapshot = MetricsSnapshot {
          health: data.health,
          metrics: data.metrics,
          timestamp: None,
        };
        self.store.set(&keys.metrics, snapshot.to_value());
      }
      PushEvent::QuickMetrics(quick) => {
        self
          .store
          .update(&keys.metrics, move |current| merge_quick_metrics(current, &quick));
      }
      PushEvent::ServiceAlert(alert) => {
        tracing::info!("service {} is {}", alert.service, alert.status);
        self.notify(Notification::ServiceAlert(alert.clone()));
        self
          .store
          .update(&keys.metrics, move |current| merge_service_alert(current, &alert));
      }
      PushEvent::SessionUpdate(update) => {
        self.store.set(&keys.sessions, update.stats.clone());
        if update.action == Some(SessionAction::Terminated) {
          self.notify(Notification::SessionTerminated(update.stats));
        }
      }
      PushEvent::BackupProgress(progress) => self.notify(Notification::Backup(progress)),
      PushEvent::BulkOperationProgress(progress) => {
        self.notify(Notification::BulkProgress(progress))
      }
      PushEvent::Error(err) => {
        tracing::warn!("push channel server error: {}", err.message);
        *self.last_error.lock() = Some(ChannelError::Server(err.message.clone()));
        self.notify(Notification::ServerError(err.message));
      }
    }
  }
}

async fn run(inner: Arc<Inner>) {
  let mut delay = inner.config.reconnect_delay();
  loop {
    inner.set_state(ConnectionState::Connecting);
    match inner.transport.connect().await {
      Ok(PushConnection {
        mut events,
        commands,
      }) => {
        delay = inner.config.reconnect_delay();
        inner.on_connected(commands);
        while let Some(event) = events.recv().await {
          match event {
            Ok(event) => inner.apply(event),
            Err(e) => tracing::warn!("Dropping malformed push event: {}", e),
          }
        }
        tracing::info!("push channel closed by remote");
        inner.on_dropped(ConnectionState::Disconnected, ChannelError::Closed);
      }
      Err(e) => {
        tracing::warn!("push channel connect failed: {}", e);
        inner.on_dropped(ConnectionState::Error, e);
      }
    }

    tokio::time::sleep(delay).await;
    delay = (delay * 2).min(inner.config.max_reconnect_delay());
  }
}
