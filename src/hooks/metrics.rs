use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::cache::{CacheEntry, Subscription};
use crate::channel::events::Health;
use crate::channel::{
  ChannelLease, ConnectionState, MetricsSnapshot, Notification, PushChannel,
};
use crate::error::{ChannelError, SwrError};

/// Admin-dashboard view over a [`PushChannel`]: the metrics and sessions
/// keys plus the connection state.
///
/// Each socket holds a lease, so the connection stays up while at least
/// one socket is alive.
pub struct MetricsSocket {
  channel: PushChannel,
  metrics: watch::Receiver<CacheEntry>,
  sessions: watch::Receiver<CacheEntry>,
  state: watch::Receiver<ConnectionState>,
  _subscriptions: [Subscription; 2],
  _lease: ChannelLease,
}

impl MetricsSocket {
  pub fn new(channel: &PushChannel) -> Self {
    let store = channel.store();
    let keys = &channel.config().keys;
    let (metrics_sub, metrics) = store.subscribe_watch(&keys.metrics);
    let (sessions_sub, sessions) = store.subscribe_watch(&keys.sessions);
    let state = channel.watch_state();
    let lease = channel.attach();

    Self {
      channel: channel.clone(),
      metrics,
      sessions,
      state,
      _subscriptions: [metrics_sub, sessions_sub],
      _lease: lease,
    }
  }

  pub fn metrics(&self) -> Option<MetricsSnapshot> {
    self
      .metrics
      .borrow()
      .data
      .as_ref()
      .and_then(MetricsSnapshot::from_value)
  }

  pub fn health(&self) -> Option<Health> {
    self.metrics().map(|snapshot| snapshot.health)
  }

  pub fn sessions(&self) -> Option<Value> {
    self.sessions.borrow().data.clone()
  }

  pub fn metrics_entry(&self) -> CacheEntry {
    self.metrics.borrow().clone()
  }

  pub fn connection_state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  pub fn is_connected(&self) -> bool {
    self.connection_state() == ConnectionState::Connected
  }

  pub fn notifications(&self) -> broadcast::Receiver<Notification> {
    self.channel.notifications()
  }

  /// Wait until metrics, sessions or the connection state change.
  pub async fn changed(&mut self) -> bool {
    tokio::select! {
      r = self.metrics.changed() => r.is_ok(),
      r = self.sessions.changed() => r.is_ok(),
      r = self.state.changed() => r.is_ok(),
    }
  }

  pub async fn refresh_metrics(&self) -> Result<(), SwrError> {
    self.channel.refresh_metrics().await
  }

  pub fn refresh_sessions(&self) -> Result<(), ChannelError> {
    self.channel.refresh_sessions()
  }
}
